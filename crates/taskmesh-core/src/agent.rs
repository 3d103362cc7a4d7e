use crate::error::{MeshError, MeshResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Heartbeat age (seconds) below which an agent is online.
pub const ONLINE_WITHIN_SECS: i64 = 60;
/// Heartbeat age (seconds) at or above which an agent is offline.
pub const OFFLINE_AFTER_SECS: i64 = 120;

/// Free-form key/value metadata attached to a registration.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Liveness of a registered agent.
///
/// Never trusted verbatim from storage: consumers get the value recomputed
/// from the heartbeat age via [`AgentRegistration::with_recomputed_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Heartbeat younger than 60s.
    Online,
    /// Heartbeat between 60s and 120s old.
    Degraded,
    /// Heartbeat 120s or older, or explicitly marked offline.
    Offline,
}

impl AgentStatus {
    /// Classify a heartbeat age. Negative ages (clock skew) count as fresh.
    pub fn from_heartbeat_age(age: Duration) -> Self {
        let secs = age.num_seconds();
        if secs < ONLINE_WITHIN_SECS {
            AgentStatus::Online
        } else if secs < OFFLINE_AFTER_SECS {
            AgentStatus::Degraded
        } else {
            AgentStatus::Offline
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Degraded => write!(f, "degraded"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A named unit of work an agent declares it can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapability {
    /// Capability name, matched exactly against task submissions.
    pub name: String,
    /// Preference weight in `[0, 1]`; the scorer's base weight.
    pub weight: f64,
    /// Whether the agent considers itself a preferred provider.
    #[serde(default)]
    pub preferred: bool,
    /// Requirements the agent declares (informational).
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Human-readable duration estimate, e.g. `"2m"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
}

impl AgentCapability {
    /// A non-preferred capability with no requirements.
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            preferred: false,
            requirements: Vec::new(),
            estimated_duration: None,
        }
    }

    /// Mark as the agent's preferred capability.
    pub fn preferred(mut self) -> Self {
        self.preferred = true;
        self
    }

    /// Add a free-form requirement tag.
    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }
}

/// An agent's registration record, owned by the agent that registers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    /// Unique, stable identity. Also names the agent's bus topic.
    pub app_id: String,
    /// Display name.
    pub name: String,
    /// Declared capabilities, immutable for the registration's lifetime.
    #[serde(default)]
    pub capabilities: Vec<AgentCapability>,
    /// Stored liveness hint; recomputed on every read.
    #[serde(default = "default_status")]
    pub status: AgentStatus,
    /// Dependency health checks, name → URL.
    #[serde(default)]
    pub health_checks: BTreeMap<String, String>,
    /// Time of the last heartbeat (or registration).
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
    /// Optional free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

fn default_status() -> AgentStatus {
    AgentStatus::Online
}

impl AgentRegistration {
    /// Creates an online registration with a fresh heartbeat and no capabilities.
    pub fn new(app_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            name: name.into(),
            capabilities: Vec::new(),
            status: AgentStatus::Online,
            health_checks: BTreeMap::new(),
            last_heartbeat: Utc::now(),
            metadata: None,
        }
    }

    /// Append a capability card.
    pub fn with_capability(mut self, capability: AgentCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Add a dependency check URL under `name`.
    pub fn with_health_check(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.health_checks.insert(name.into(), url.into());
        self
    }

    /// Looks up a declared capability by name.
    pub fn capability(&self, name: &str) -> Option<&AgentCapability> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    /// Whether a card named `name` is declared.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capability(name).is_some()
    }

    /// Age of the last heartbeat relative to `now`.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat
    }

    /// Replaces the stored status hint with the one implied by heartbeat age.
    pub fn with_recomputed_status(mut self, now: DateTime<Utc>) -> Self {
        self.status = AgentStatus::from_heartbeat_age(self.heartbeat_age(now));
        self
    }

    /// Checks the registration is well-formed before it is stored.
    pub fn validate(&self) -> MeshResult<()> {
        if self.app_id.trim().is_empty() {
            return Err(MeshError::Validation("appId must not be empty".into()));
        }
        for cap in &self.capabilities {
            if cap.name.trim().is_empty() {
                return Err(MeshError::Validation(format!(
                    "agent '{}' declares a capability with an empty name",
                    self.app_id
                )));
            }
            if !(0.0..=1.0).contains(&cap.weight) {
                return Err(MeshError::Validation(format!(
                    "capability '{}' weight {} is outside [0, 1]",
                    cap.name, cap.weight
                )));
            }
        }
        let mut names: Vec<&str> = self.capabilities.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(MeshError::Validation(format!(
                "agent '{}' declares the same capability twice",
                self.app_id
            )));
        }
        Ok(())
    }
}
