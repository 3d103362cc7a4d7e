use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use taskmesh_core::{AgentRegistration, MeshError, MeshResult};
use tracing::debug;

/// Summarises an agent's dependency health as a value in `[0, 1]`.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Health of `reg`'s dependencies; 1.0 is fully healthy.
    async fn dependency_health(&self, reg: &AgentRegistration) -> f64;
}

/// Checks each configured health-check URL over HTTP.
///
/// A check is healthy when it answers 2xx within the timeout. The summary is
/// the healthy fraction, or 1.0 when the agent configures no checks.
pub struct HttpHealthChecker {
    client: reqwest::Client,
}

impl HttpHealthChecker {
    /// Each check URL must answer within `timeout`.
    pub fn new(timeout: Duration) -> MeshResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MeshError::Http(format!("failed to build health client: {e}")))?;
        Ok(Self { client })
    }

    async fn check_url(&self, name: &str, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                debug!(check = %name, status = %resp.status(), "Health check unhealthy");
                false
            }
            Err(e) => {
                debug!(check = %name, error = %e, "Health check unreachable");
                false
            }
        }
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn dependency_health(&self, reg: &AgentRegistration) -> f64 {
        if reg.health_checks.is_empty() {
            return 1.0;
        }
        let results = join_all(
            reg.health_checks
                .iter()
                .map(|(name, url)| self.check_url(name, url)),
        )
        .await;
        let healthy = results.iter().filter(|ok| **ok).count();
        healthy as f64 / results.len() as f64
    }
}

/// Fixed health values, keyed by `appId`, with a default for everyone else.
pub struct StaticHealth {
    default: f64,
    overrides: RwLock<HashMap<String, f64>>,
}

impl StaticHealth {
    /// Every agent fully healthy.
    pub fn healthy() -> Self {
        Self::with_default(1.0)
    }

    /// Every agent reports `default`, clamped to `[0, 1]`.
    pub fn with_default(default: f64) -> Self {
        Self {
            default: default.clamp(0.0, 1.0),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Pin one agent's health.
    pub fn set(&self, app_id: impl Into<String>, health: f64) {
        self.overrides
            .write()
            .insert(app_id.into(), health.clamp(0.0, 1.0));
    }
}

#[async_trait]
impl HealthChecker for StaticHealth {
    async fn dependency_health(&self, reg: &AgentRegistration) -> f64 {
        self.overrides
            .read()
            .get(&reg.app_id)
            .copied()
            .unwrap_or(self.default)
    }
}
