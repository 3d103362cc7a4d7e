use crate::error::{MeshError, MeshResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of dispatch attempts per task, the first one included.
pub const MAX_ATTEMPTS: u32 = 3;
/// Priority assigned when a submission omits one.
pub const DEFAULT_PRIORITY: u8 = 5;
/// Highest accepted priority.
pub const MAX_PRIORITY: u8 = 10;
/// Timeout assigned when a submission omits one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Error type recorded for attempts that never produced a result.
pub const TIMEOUT_ERROR_KIND: &str = "timeout";

/// Opaque task payload. The scheduler forwards it unchanged.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A task submission as received by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmission {
    /// Capability the task needs, matched against agent cards.
    pub capability: String,
    /// Forwarded to the agent untouched.
    #[serde(default)]
    pub payload: Payload,
    /// `1..=10`; the configured default when absent.
    #[serde(default)]
    pub priority: Option<i64>,
    /// Per-attempt timeout in seconds, at least 1.
    #[serde(default)]
    pub timeout: Option<i64>,
}

impl TaskSubmission {
    /// A submission using the default priority and timeout.
    pub fn new(capability: impl Into<String>, payload: Payload) -> Self {
        Self {
            capability: capability.into(),
            payload,
            priority: None,
            timeout: None,
        }
    }

    /// Set an explicit priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set an explicit per-attempt timeout.
    pub fn with_timeout(mut self, secs: i64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// Parses an untyped body, reporting shape problems as validation errors.
    pub fn from_value(value: serde_json::Value) -> MeshResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| MeshError::Validation(format!("malformed task submission: {e}")))
    }

    /// Validates ranges and resolves defaults into `(priority, timeout_secs)`.
    pub fn resolve(&self, default_priority: u8, default_timeout_secs: u64) -> MeshResult<(u8, u64)> {
        if self.capability.trim().is_empty() {
            return Err(MeshError::Validation("capability must not be empty".into()));
        }
        let priority = match self.priority {
            None => default_priority,
            Some(p) if (0..=i64::from(MAX_PRIORITY)).contains(&p) => p as u8,
            Some(p) => {
                return Err(MeshError::Validation(format!(
                    "priority {p} is outside [0, {MAX_PRIORITY}]"
                )))
            }
        };
        let timeout = match self.timeout {
            None => default_timeout_secs,
            Some(t) if t > 0 => t as u64,
            Some(t) => {
                return Err(MeshError::Validation(format!(
                    "timeout must be a positive number of seconds, got {t}"
                )))
            }
        };
        Ok((priority, timeout))
    }
}

/// The envelope published to an agent's topic for one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Stable task id, identical across retries.
    pub id: Uuid,
    /// Requested capability.
    pub capability: String,
    /// Original payload, identical across retries.
    pub payload: Payload,
    /// Priority, `1..=10`.
    pub priority: u8,
    /// Attempt timeout in seconds.
    pub timeout: u64,
    /// Scheduler identity stamped on every request.
    pub requested_by: String,
    /// When the task was first submitted.
    pub created_at: DateTime<Utc>,
    /// Dispatch generation this request belongs to. Agents may echo it back.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

/// Structured error reported by an agent, or synthesised on timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Short machine-readable category, `"timeout"` for synthesised errors.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

impl TaskError {
    /// An error of `kind`.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The error recorded when an attempt's timer fires.
    pub fn timeout(timeout_secs: u64) -> Self {
        Self::new(
            TIMEOUT_ERROR_KIND,
            format!("no result within {timeout_secs}s"),
        )
    }

    /// Whether the scheduler synthesised this on timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind == TIMEOUT_ERROR_KIND
    }
}

/// The envelope an agent publishes once per attempt it receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Task id.
    pub task_id: Uuid,
    /// `appId` of the agent that ran the attempt.
    pub agent_id: String,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Agent output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    /// Failure details; may be absent even when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Wall time the agent reports for the attempt.
    #[serde(default)]
    pub duration_ms: u64,
    /// Set by the agent. Defaults to receipt time when omitted.
    #[serde(default = "Utc::now")]
    pub completed_at: DateTime<Utc>,
    /// Echo of [`TaskRequest::attempt`], when the agent supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl TaskResult {
    /// A successful result completed now.
    pub fn success(task_id: Uuid, agent_id: impl Into<String>, result: Payload) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            success: true,
            result: Some(result),
            error: None,
            duration_ms: 0,
            completed_at: Utc::now(),
            attempt: None,
        }
    }

    /// A failed result completed now.
    pub fn failure(task_id: Uuid, agent_id: impl Into<String>, error: TaskError) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            success: false,
            result: None,
            error: Some(error),
            duration_ms: 0,
            completed_at: Utc::now(),
            attempt: None,
        }
    }

    /// Result synthesised by the scheduler when an attempt's timer fires.
    pub fn timed_out(status: &TaskStatus) -> Self {
        let elapsed = (Utc::now() - status.dispatched_at).num_milliseconds().max(0);
        Self {
            duration_ms: elapsed as u64,
            attempt: Some(status.generation),
            ..Self::failure(
                status.task_id,
                status.dispatched_to.clone(),
                TaskError::timeout(status.timeout_secs),
            )
        }
    }

    /// Set the reported duration.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Echo a dispatch generation.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Parses a bus delivery, reporting any shape problem as a validation error.
    pub fn from_value(value: serde_json::Value) -> MeshResult<Self> {
        let result: Self = serde_json::from_value(value)
            .map_err(|e| MeshError::Validation(format!("malformed task result: {e}")))?;
        if result.agent_id.trim().is_empty() {
            return Err(MeshError::Validation("task result has an empty agentId".into()));
        }
        Ok(result)
    }
}

/// Lifecycle state of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Accepted, not yet dispatched.
    Pending,
    /// First attempt in flight.
    Dispatched,
    /// A retry attempt is in flight.
    Retrying,
    /// An agent reported success.
    Completed,
    /// Attempts exhausted, or no agent left to retry on.
    Failed,
    /// Attempts exhausted with the last one timing out.
    Timeout,
}

impl TaskState {
    /// `Completed` and `Failed` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Timeout
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Dispatched => "dispatched",
            TaskState::Retrying => "retrying",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskState {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "dispatched" => Ok(TaskState::Dispatched),
            "retrying" => Ok(TaskState::Retrying),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "timeout" => Ok(TaskState::Timeout),
            other => Err(MeshError::Validation(format!("unknown task state '{other}'"))),
        }
    }
}

/// The scheduler's view of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// Task id.
    pub task_id: Uuid,
    /// Requested capability.
    pub capability: String,
    /// Agent holding the current attempt.
    pub dispatched_to: String,
    /// Start of the current attempt; the timeout runs from here.
    pub dispatched_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: TaskState,
    /// Dispatches so far, including the first.
    pub attempts: u32,
    /// Original payload.
    pub payload: Payload,
    /// Bumped on every (re)dispatch; stale callbacks compare against it.
    pub generation: u32,
    /// Priority, `1..=10`.
    pub priority: u8,
    /// Per-attempt timeout.
    #[serde(rename = "timeout")]
    pub timeout_secs: u64,
    /// Scheduler identity stamped on every request.
    pub requested_by: String,
    /// When the task was first submitted.
    pub created_at: DateTime<Utc>,
    /// Error from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskError>,
    /// The winning agent's result, set once the task completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
}

impl TaskStatus {
    /// The request for the current attempt: original id and payload, current generation.
    pub fn request(&self) -> TaskRequest {
        TaskRequest {
            id: self.task_id,
            capability: self.capability.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            timeout: self.timeout_secs,
            requested_by: self.requested_by.clone(),
            created_at: self.created_at,
            attempt: self.generation,
        }
    }

    /// No retry budget left.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= MAX_ATTEMPTS
    }
}
