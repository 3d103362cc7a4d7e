use crate::bus::{agent_topic, unwrap_cloud_event, MessageBus};
use crate::registry::AgentRegistry;
use crate::scorer::{AgentScoreCard, AgentScorer};
use crate::trace::{TraceEvent, TraceKind, TraceSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use taskmesh_core::{
    AgentRegistration, MeshError, MeshResult, TaskError, TaskResult, TaskState, TaskStatus,
    TaskSubmission, DEFAULT_PRIORITY, DEFAULT_TIMEOUT_SECS,
};
use taskmesh_store::{CheckpointRow, CheckpointStore};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// `requestedBy` stamped on every request when none is configured.
pub const DEFAULT_REQUESTED_BY: &str = "taskmesh-scheduler";
/// Completed tasks kept for status queries after they leave tracking.
pub const DEFAULT_COMPLETED_CACHE_SIZE: usize = 1024;

/// Scheduler tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Identity stamped into `requestedBy` on every request.
    pub requested_by: String,
    /// Priority for submissions that omit one.
    pub default_priority: u8,
    /// Per-attempt timeout for submissions that omit one.
    pub default_timeout_secs: u64,
    /// How many finished statuses stay queryable after the task leaves the map.
    pub completed_cache_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            requested_by: DEFAULT_REQUESTED_BY.to_string(),
            default_priority: DEFAULT_PRIORITY,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            completed_cache_size: DEFAULT_COMPLETED_CACHE_SIZE,
        }
    }
}

/// The dispatch decision returned to a submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    /// Task id.
    pub task_id: Uuid,
    /// Agent chosen for the first attempt.
    pub dispatched_to: String,
    /// Its final score at dispatch time.
    pub score: f64,
    /// Current lifecycle state.
    pub status: TaskState,
}

/// Why a result delivery was acknowledged without effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not a valid `TaskResult` envelope.
    Malformed,
    /// No tracked task with that id.
    UnknownTask,
    /// Belongs to an earlier attempt, or the task already finished.
    Stale,
}

/// Outcome of handling one result delivery. Every delivery is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    /// Applied; carries the task's state afterwards.
    Accepted(TaskState),
    /// Acknowledged and ignored.
    Dropped(DropReason),
}

impl ResultDisposition {
    /// Whether the delivery changed task state.
    pub fn is_accepted(&self) -> bool {
        matches!(self, ResultDisposition::Accepted(_))
    }
}

/// Await a fallible side effect, log a failure and carry on.
pub async fn best_effort<T, F>(operation: &str, fut: F) -> Option<T>
where
    F: Future<Output = MeshResult<T>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(operation, error = %e, "Best-effort operation failed; continuing in memory");
            None
        }
    }
}

struct TaskEntry {
    status: TaskStatus,
    /// Timer of the current generation.
    timer: Option<JoinHandle<()>>,
    /// Set once the task reaches a terminal state; later callbacks are no-ops.
    closed: bool,
    /// `(agentId, completedAt)` of every agent result already applied.
    applied: Vec<(String, DateTime<Utc>)>,
}

impl TaskEntry {
    fn new(status: TaskStatus) -> Self {
        Self {
            status,
            timer: None,
            closed: false,
            applied: Vec::new(),
        }
    }

    fn is_stale(&self, result: &TaskResult) -> bool {
        self.closed
            || result.agent_id != self.status.dispatched_to
            || result
                .attempt
                .is_some_and(|attempt| attempt != self.status.generation)
            || self.was_applied(result)
    }

    /// A redelivery of an envelope that already moved this task on. Catches
    /// the A -> B -> A retry path, where agent and attempt alone match again.
    fn was_applied(&self, result: &TaskResult) -> bool {
        self.applied
            .iter()
            .any(|(agent, at)| *agent == result.agent_id && *at == result.completed_at)
    }
}

struct CompletedCache {
    capacity: usize,
    order: VecDeque<Uuid>,
    tasks: HashMap<Uuid, TaskStatus>,
}

impl CompletedCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            tasks: HashMap::new(),
        }
    }

    fn insert(&mut self, status: TaskStatus) {
        if self.capacity == 0 {
            return;
        }
        if self.tasks.insert(status.task_id, status.clone()).is_none() {
            self.order.push_back(status.task_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.tasks.remove(&oldest);
            }
        }
    }

    fn get(&self, task_id: &Uuid) -> Option<&TaskStatus> {
        self.tasks.get(task_id)
    }
}

struct Inner {
    registry: Arc<AgentRegistry>,
    scorer: Arc<AgentScorer>,
    bus: Arc<dyn MessageBus>,
    checkpoints: Arc<dyn CheckpointStore>,
    trace: TraceSink,
    config: OrchestratorConfig,
    tasks: parking_lot::RwLock<HashMap<Uuid, Arc<Mutex<TaskEntry>>>>,
    completed: parking_lot::Mutex<CompletedCache>,
}

/// Owns the task lifecycle: dispatch, timeout, retry, recovery, shutdown.
///
/// Every mutation of a task happens under that task's own async mutex, and
/// each timer is bound to the `generation` it was armed for, so a late timer
/// or a result for an earlier attempt cannot act on a newer one.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Wire a scheduler. Call [`Orchestrator::recover`] before serving traffic.
    pub fn new(
        registry: Arc<AgentRegistry>,
        scorer: Arc<AgentScorer>,
        bus: Arc<dyn MessageBus>,
        checkpoints: Arc<dyn CheckpointStore>,
        trace: TraceSink,
        config: OrchestratorConfig,
    ) -> Self {
        let completed = parking_lot::Mutex::new(CompletedCache::new(config.completed_cache_size));
        Self {
            inner: Arc::new(Inner {
                registry,
                scorer,
                bus,
                checkpoints,
                trace,
                config,
                tasks: parking_lot::RwLock::new(HashMap::new()),
                completed,
            }),
        }
    }

    /// The agent registry this scheduler dispatches from.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    /// The scorer ranking candidates.
    pub fn scorer(&self) -> &Arc<AgentScorer> {
        &self.inner.scorer
    }

    /// Tunables in effect.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Number of tasks currently tracked (non-terminal).
    pub fn tracked_count(&self) -> usize {
        self.inner.tasks.read().len()
    }

    /// Pick the best agent for the submission and dispatch to it.
    pub async fn submit(&self, submission: TaskSubmission) -> MeshResult<DispatchReceipt> {
        let config = &self.inner.config;
        let (priority, timeout_secs) =
            submission.resolve(config.default_priority, config.default_timeout_secs)?;
        let TaskSubmission {
            capability,
            payload,
            ..
        } = submission;

        let candidates = self.inner.registry.find_by_capability(&capability).await?;
        if candidates.is_empty() {
            warn!(capability = %capability, "No registered agents for capability");
            return Err(MeshError::NoAgentsAvailable { capability });
        }
        let cards = self.inner.scorer.score(&candidates, &capability).await;
        let Some(top) = cards.into_iter().next() else {
            warn!(capability = %capability, "No healthy agents for capability");
            return Err(MeshError::NoAgentsAvailable { capability });
        };

        let now = Utc::now();
        let task_id = Uuid::new_v4();
        let entry = Arc::new(Mutex::new(TaskEntry::new(TaskStatus {
            task_id,
            capability: capability.clone(),
            dispatched_to: top.agent_id.clone(),
            dispatched_at: now,
            status: TaskState::Dispatched,
            attempts: 1,
            payload,
            generation: 1,
            priority,
            timeout_secs,
            requested_by: config.requested_by.clone(),
            created_at: now,
            last_error: None,
            result: None,
        })));

        // Tracked and locked before publishing, so a fast result waits for us.
        let mut guard = entry.lock().await;
        self.inner.tasks.write().insert(task_id, Arc::clone(&entry));

        if let Err(e) = self.publish_request(&guard.status).await {
            guard.closed = true;
            self.inner.tasks.write().remove(&task_id);
            error!(task_id = %task_id, agent = %top.agent_id, error = %e, "Dispatch failed");
            return Err(e);
        }
        self.inner.scorer.note_dispatch(&top.agent_id, &capability);
        guard.timer = Some(self.arm_timer(task_id, 1, Duration::from_secs(timeout_secs)));
        self.checkpoint(&guard.status).await;
        self.inner.trace.emit(
            TraceEvent::new(TraceKind::Dispatched, &guard.status)
                .with_details(json!({ "score": top.final_score })),
        );

        info!(
            task_id = %task_id,
            capability = %capability,
            agent = %top.agent_id,
            score = top.final_score,
            "Task dispatched"
        );
        Ok(DispatchReceipt {
            task_id,
            dispatched_to: top.agent_id,
            score: top.final_score,
            status: TaskState::Dispatched,
        })
    }

    /// Handle an untyped bus delivery, bare or CloudEvents-wrapped.
    /// Malformed envelopes are dropped.
    pub async fn handle_result_value(&self, value: Value) -> ResultDisposition {
        match TaskResult::from_value(unwrap_cloud_event(value)) {
            Ok(result) => self.handle_result(result).await,
            Err(e) => {
                warn!(error = %e, "Dropping malformed task result");
                ResultDisposition::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Apply one attempt's result.
    pub async fn handle_result(&self, result: TaskResult) -> ResultDisposition {
        let Some(entry) = self.entry(result.task_id) else {
            warn!(
                task_id = %result.task_id,
                agent = %result.agent_id,
                "Result for untracked task ignored"
            );
            return ResultDisposition::Dropped(DropReason::UnknownTask);
        };

        let mut guard = entry.lock().await;
        if guard.is_stale(&result) {
            warn!(
                task_id = %result.task_id,
                agent = %result.agent_id,
                attempt = ?result.attempt,
                generation = guard.status.generation,
                "Stale or duplicate result ignored"
            );
            return ResultDisposition::Dropped(DropReason::Stale);
        }
        if let Some(timer) = guard.timer.take() {
            timer.abort();
        }
        guard
            .applied
            .push((result.agent_id.clone(), result.completed_at));
        let state = self.complete_attempt(&mut guard, result).await;
        ResultDisposition::Accepted(state)
    }

    /// Timer callback for `(task_id, generation)`.
    pub async fn handle_timeout(&self, task_id: Uuid, generation: u32) {
        let Some(entry) = self.entry(task_id) else {
            debug!(task_id = %task_id, generation, "Timer fired for finished task");
            return;
        };

        let mut guard = entry.lock().await;
        if guard.closed || guard.status.generation != generation {
            debug!(
                task_id = %task_id,
                generation,
                current = guard.status.generation,
                "Stale timer ignored"
            );
            return;
        }
        // This is the running timer's own handle; dropping it detaches.
        drop(guard.timer.take());

        warn!(
            task_id = %task_id,
            agent = %guard.status.dispatched_to,
            generation,
            timeout_secs = guard.status.timeout_secs,
            "Attempt timed out"
        );
        self.inner.trace.emit(
            TraceEvent::new(TraceKind::TimedOut, &guard.status)
                .with_details(json!({ "timeout": guard.status.timeout_secs })),
        );
        let result = TaskResult::timed_out(&guard.status);
        self.complete_attempt(&mut guard, result).await;
    }

    async fn complete_attempt(&self, entry: &mut TaskEntry, result: TaskResult) -> TaskState {
        let capability = entry.status.capability.clone();
        self.inner
            .scorer
            .record_task_result(&result, &capability)
            .await;

        if result.success {
            entry.status.result = result.result;
            entry.status.last_error = None;
            info!(
                task_id = %entry.status.task_id,
                agent = %result.agent_id,
                attempts = entry.status.attempts,
                duration_ms = result.duration_ms,
                "Task completed"
            );
            self.finish(entry, TaskState::Completed).await;
            return TaskState::Completed;
        }

        let error = result
            .error
            .unwrap_or_else(|| TaskError::new("agent_failure", "agent reported failure"));
        let timed_out = error.is_timeout();
        warn!(
            task_id = %entry.status.task_id,
            agent = %result.agent_id,
            attempts = entry.status.attempts,
            error_type = %error.kind,
            error = %error.message,
            "Attempt failed"
        );
        entry.status.last_error = Some(error);

        if entry.status.attempts_exhausted() {
            let terminal = if timed_out {
                TaskState::Timeout
            } else {
                TaskState::Failed
            };
            warn!(
                task_id = %entry.status.task_id,
                attempts = entry.status.attempts,
                "Attempts exhausted"
            );
            self.finish(entry, terminal).await;
            return terminal;
        }
        self.retry(entry).await
    }

    /// Re-dispatch to the best agent other than the one that just failed,
    /// falling back to that same agent when it is the only candidate.
    async fn retry(&self, entry: &mut TaskEntry) -> TaskState {
        let previous = entry.status.dispatched_to.clone();
        let capability = entry.status.capability.clone();
        let task_id = entry.status.task_id;

        let candidates = match self.inner.registry.find_by_capability(&capability).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Registry unavailable during retry");
                Vec::new()
            }
        };
        let cards = self.inner.scorer.score(&candidates, &capability).await;
        let next = cards
            .iter()
            .find(|card| card.agent_id != previous)
            .or_else(|| cards.first())
            .cloned();
        let Some(next) = next else {
            warn!(task_id = %task_id, capability = %capability, "No agents left for retry");
            self.finish(entry, TaskState::Failed).await;
            return TaskState::Failed;
        };

        entry.status.attempts += 1;
        entry.status.generation += 1;
        entry.status.dispatched_to = next.agent_id.clone();
        entry.status.dispatched_at = Utc::now();
        entry.status.status = TaskState::Retrying;
        let generation = entry.status.generation;

        if let Err(e) = self.publish_request(&entry.status).await {
            // The timer below turns a lost publish into a timeout.
            warn!(
                task_id = %task_id,
                agent = %next.agent_id,
                error = %e,
                "Retry publish failed"
            );
        }
        self.inner.scorer.note_dispatch(&next.agent_id, &capability);
        entry.timer = Some(self.arm_timer(
            task_id,
            generation,
            Duration::from_secs(entry.status.timeout_secs),
        ));
        self.checkpoint(&entry.status).await;
        self.inner.trace.emit(
            TraceEvent::new(TraceKind::Retried, &entry.status)
                .with_details(json!({ "previous": previous, "score": next.final_score })),
        );

        info!(
            task_id = %task_id,
            previous = %previous,
            agent = %next.agent_id,
            attempts = entry.status.attempts,
            generation,
            "Task re-dispatched"
        );
        TaskState::Retrying
    }

    async fn finish(&self, entry: &mut TaskEntry, state: TaskState) {
        entry.closed = true;
        entry.status.status = state;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        let task_id = entry.status.task_id;

        if state == TaskState::Completed {
            self.inner.completed.lock().insert(entry.status.clone());
        }
        best_effort(
            "checkpoint delete",
            self.inner.checkpoints.delete(task_id),
        )
        .await;

        let kind = if state == TaskState::Completed {
            TraceKind::Completed
        } else {
            TraceKind::Failed
        };
        let details = match &entry.status.last_error {
            Some(error) => json!({ "status": state, "error": error }),
            None => json!({ "status": state }),
        };
        self.inner
            .trace
            .emit(TraceEvent::new(kind, &entry.status).with_details(details));
        self.inner.tasks.write().remove(&task_id);
    }

    /// Re-arm timers for every checkpointed task. Returns how many were restored.
    pub async fn recover(&self) -> MeshResult<usize> {
        let rows = self.inner.checkpoints.load_all().await.map_err(|e| {
            error!(error = %e, "Failed to load checkpoints");
            e
        })?;

        let now = Utc::now();
        let mut recovered = 0;
        for row in rows {
            if row.status.is_terminal() {
                best_effort(
                    "checkpoint delete",
                    self.inner.checkpoints.delete(row.task_id),
                )
                .await;
                continue;
            }
            if self.entry(row.task_id).is_some() {
                continue;
            }

            let remaining = row.remaining(now);
            let status = row.into_status();
            let (task_id, generation) = (status.task_id, status.generation);
            let entry = Arc::new(Mutex::new(TaskEntry::new(status)));
            let mut guard = entry.lock().await;
            self.inner.tasks.write().insert(task_id, Arc::clone(&entry));
            guard.timer = Some(self.arm_timer(task_id, generation, remaining));

            self.inner.trace.emit(
                TraceEvent::new(TraceKind::Recovered, &guard.status)
                    .with_details(json!({ "remainingMs": remaining.as_millis() as u64 })),
            );
            info!(
                task_id = %task_id,
                agent = %guard.status.dispatched_to,
                attempts = guard.status.attempts,
                generation,
                remaining_ms = remaining.as_millis() as u64,
                "Recovered in-flight task"
            );
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Checkpoint every tracked task, stop its timer and release the store.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<Mutex<TaskEntry>>> =
            self.inner.tasks.read().values().cloned().collect();
        let mut saved = 0usize;
        for entry in entries {
            let mut guard = entry.lock().await;
            if let Some(timer) = guard.timer.take() {
                timer.abort();
            }
            if guard.closed {
                continue;
            }
            let row = CheckpointRow::from_status(&guard.status);
            if best_effort("checkpoint save", self.inner.checkpoints.save(&row))
                .await
                .is_some()
            {
                saved += 1;
            }
        }
        best_effort("checkpoint close", self.inner.checkpoints.close()).await;
        info!(checkpointed = saved, "Orchestrator shut down");
    }

    /// A tracked task, or a recently completed one.
    pub async fn get_task(&self, task_id: Uuid) -> Option<TaskStatus> {
        if let Some(entry) = self.entry(task_id) {
            let guard = entry.lock().await;
            if !guard.closed {
                return Some(guard.status.clone());
            }
        }
        self.inner.completed.lock().get(&task_id).cloned()
    }

    /// All registrations with recomputed status.
    pub async fn list_agents(&self) -> MeshResult<Vec<AgentRegistration>> {
        self.inner.registry.list_all().await
    }

    /// Ranked candidates for `capability`, without dispatching.
    pub async fn preview_scores(&self, capability: &str) -> MeshResult<Vec<AgentScoreCard>> {
        let candidates = self.inner.registry.find_by_capability(capability).await?;
        Ok(self.inner.scorer.score(&candidates, capability).await)
    }

    /// Feed a results topic subscription into [`Orchestrator::handle_result_value`].
    pub fn spawn_result_listener(&self, mut results: mpsc::UnboundedReceiver<Value>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(value) = results.recv().await {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator.handle_result_value(value).await;
                });
            }
            debug!("Result listener stopped");
        })
    }

    fn entry(&self, task_id: Uuid) -> Option<Arc<Mutex<TaskEntry>>> {
        self.inner.tasks.read().get(&task_id).cloned()
    }

    async fn publish_request(&self, status: &TaskStatus) -> MeshResult<()> {
        let envelope = serde_json::to_value(status.request())?;
        self.inner
            .bus
            .publish(&agent_topic(&status.dispatched_to), &envelope)
            .await
    }

    async fn checkpoint(&self, status: &TaskStatus) {
        let row = CheckpointRow::from_status(status);
        best_effort("checkpoint save", self.inner.checkpoints.save(&row)).await;
    }

    fn arm_timer(&self, task_id: Uuid, generation: u32, after: Duration) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = inner.upgrade() {
                Orchestrator { inner }
                    .handle_timeout(task_id, generation)
                    .await;
            }
        })
    }
}
