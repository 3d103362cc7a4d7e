use crate::health::HealthChecker;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taskmesh_core::{AgentRegistration, TaskResult};
use taskmesh_store::{OutcomeRecord, OutcomeStore};
use tracing::{debug, warn};

/// Number of recent outcomes considered per `(agent, capability)`.
pub const DEFAULT_WINDOW: usize = 20;
/// Success rate assumed for an agent without history.
pub const NO_HISTORY_SUCCESS_RATE: f64 = 0.5;
/// Boost applied to the agent most recently used for a capability.
pub const DEFAULT_RECENCY_PENALTY: f64 = 0.95;
/// Boost applied to every other candidate.
pub const DEFAULT_RECENCY_BONUS: f64 = 1.05;

/// Ranking of one candidate for one capability. Computed per request, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentScoreCard {
    /// Agent `appId`.
    pub agent_id: String,
    /// Requested capability.
    pub capability: String,
    /// Self-declared weight from the agent card.
    pub base_weight: f64,
    /// Fraction of healthy dependency checks.
    pub dependency_health: f64,
    /// Success share over the scoring window; 1.0 without history.
    pub rolling_success_rate: f64,
    /// Penalty for the last-used agent, bonus for the rest.
    pub recency_boost: f64,
    /// Product of the four factors above.
    pub final_score: f64,
}

/// `baseWeight × dependencyHealth × (0.5 + 0.5 × successRate) × recencyBoost`.
pub fn final_score(
    base_weight: f64,
    dependency_health: f64,
    rolling_success_rate: f64,
    recency_boost: f64,
) -> f64 {
    base_weight * dependency_health * (0.5 + 0.5 * rolling_success_rate) * recency_boost
}

/// Tunables for [`AgentScorer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScorerConfig {
    /// Outcomes read per agent when computing the success rate.
    pub window: usize,
    /// Multiplier for the agent a capability last went to.
    pub recency_penalty: f64,
    /// Multiplier for every other agent.
    pub recency_bonus: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            recency_penalty: DEFAULT_RECENCY_PENALTY,
            recency_bonus: DEFAULT_RECENCY_BONUS,
        }
    }
}

/// Ranks candidate agents and records attempt outcomes.
pub struct AgentScorer {
    outcomes: Arc<dyn OutcomeStore>,
    health: Arc<dyn HealthChecker>,
    config: ScorerConfig,
    /// capability → agent most recently dispatched to.
    last_used: RwLock<HashMap<String, String>>,
}

impl AgentScorer {
    /// A scorer with default tunables.
    pub fn new(outcomes: Arc<dyn OutcomeStore>, health: Arc<dyn HealthChecker>) -> Self {
        Self::with_config(outcomes, health, ScorerConfig::default())
    }

    /// A scorer with explicit tunables.
    pub fn with_config(
        outcomes: Arc<dyn OutcomeStore>,
        health: Arc<dyn HealthChecker>,
        config: ScorerConfig,
    ) -> Self {
        Self {
            outcomes,
            health,
            config: ScorerConfig {
                window: config.window.max(1),
                recency_penalty: config.recency_penalty.clamp(0.9, 1.1),
                recency_bonus: config.recency_bonus.clamp(0.9, 1.1),
            },
            last_used: RwLock::new(HashMap::new()),
        }
    }

    /// Score `candidates` for `capability`, best first.
    ///
    /// Candidates that do not declare the capability, or whose dependency
    /// health is zero, are left out. Ties go to the lexicographically smaller
    /// `appId`.
    pub async fn score(
        &self,
        candidates: &[AgentRegistration],
        capability: &str,
    ) -> Vec<AgentScoreCard> {
        let last_used = self.last_used(capability);
        let last_used = last_used.as_deref();
        let contested = candidates.len() > 1;

        let cards = join_all(candidates.iter().filter_map(|reg| {
            let weight = reg.capability(capability)?.weight;
            Some(async move {
                let health = self.health.dependency_health(reg).await.clamp(0.0, 1.0);
                if health <= 0.0 {
                    debug!(agent = %reg.app_id, capability, "Excluded: dependencies unhealthy");
                    return None;
                }
                let rate = self.rolling_success_rate(&reg.app_id, capability).await;
                let boost = match (last_used, contested) {
                    (Some(last), true) if last == reg.app_id => self.config.recency_penalty,
                    (Some(_), true) => self.config.recency_bonus,
                    _ => 1.0,
                };
                Some(AgentScoreCard {
                    agent_id: reg.app_id.clone(),
                    capability: capability.to_string(),
                    base_weight: weight,
                    dependency_health: health,
                    rolling_success_rate: rate,
                    recency_boost: boost,
                    final_score: final_score(weight, health, rate, boost),
                })
            })
        }))
        .await;

        let mut cards: Vec<AgentScoreCard> = cards.into_iter().flatten().collect();
        cards.sort_by(|a, b| {
            b.final_score
                .total_cmp(&a.final_score)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        cards
    }

    /// Success ratio over the configured window; 0.5 without history.
    pub async fn rolling_success_rate(&self, agent_id: &str, capability: &str) -> f64 {
        match self
            .outcomes
            .recent(agent_id, capability, self.config.window)
            .await
        {
            Ok(recent) if recent.is_empty() => NO_HISTORY_SUCCESS_RATE,
            Ok(recent) => {
                let successes = recent.iter().filter(|o| o.success).count();
                successes as f64 / recent.len() as f64
            }
            Err(e) => {
                warn!(agent = %agent_id, capability, error = %e, "Outcome history unavailable");
                NO_HISTORY_SUCCESS_RATE
            }
        }
    }

    /// Append an attempt outcome to history. Failures are logged, never returned.
    pub async fn record_task_result(&self, result: &TaskResult, capability: &str) {
        let outcome = OutcomeRecord {
            agent_id: result.agent_id.clone(),
            capability: capability.to_string(),
            task_id: result.task_id,
            success: result.success,
            duration_ms: result.duration_ms,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.outcomes.record(&outcome).await {
            warn!(
                task_id = %result.task_id,
                agent = %result.agent_id,
                error = %e,
                "Failed to record task outcome"
            );
        }
    }

    /// Remember the agent a capability was last dispatched to.
    pub fn note_dispatch(&self, agent_id: &str, capability: &str) {
        self.last_used
            .write()
            .insert(capability.to_string(), agent_id.to_string());
    }

    /// Agent `capability` was last dispatched to, if any.
    pub fn last_used(&self, capability: &str) -> Option<String> {
        self.last_used.read().get(capability).cloned()
    }
}
