use crate::db::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use taskmesh_core::{MeshError, MeshResult};
use uuid::Uuid;

/// Default number of outcomes retained per `(agent, capability)` pair.
pub const DEFAULT_RETAINED_OUTCOMES: usize = 200;

/// One recorded attempt outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Agent `appId`.
    pub agent_id: String,
    /// Requested capability.
    pub capability: String,
    /// Task id.
    pub task_id: Uuid,
    /// Timeouts count as failures.
    pub success: bool,
    /// Reported attempt duration.
    pub duration_ms: u64,
    /// When the scheduler applied the result, not when the agent finished.
    pub recorded_at: DateTime<Utc>,
}

/// Outcome history consumed by the scorer.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Append one outcome, trimming the pair's history to the retention limit.
    async fn record(&self, outcome: &OutcomeRecord) -> MeshResult<()>;
    /// Up to `limit` most recent outcomes for the pair, newest first.
    async fn recent(
        &self,
        agent_id: &str,
        capability: &str,
        limit: usize,
    ) -> MeshResult<Vec<OutcomeRecord>>;
}

/// Bounded in-memory history.
pub struct MemoryOutcomeStore {
    history: RwLock<HashMap<(String, String), VecDeque<OutcomeRecord>>>,
    retain: usize,
}

impl MemoryOutcomeStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_OUTCOMES)
    }

    /// Keep at most `retain` outcomes per pair.
    pub fn with_retention(retain: usize) -> Self {
        Self {
            history: RwLock::new(HashMap::new()),
            retain: retain.max(1),
        }
    }

    /// Total outcomes held across all pairs.
    pub fn total(&self) -> usize {
        self.history.read().values().map(VecDeque::len).sum()
    }
}

impl Default for MemoryOutcomeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutcomeStore for MemoryOutcomeStore {
    async fn record(&self, outcome: &OutcomeRecord) -> MeshResult<()> {
        let mut history = self.history.write();
        let entries = history
            .entry((outcome.agent_id.clone(), outcome.capability.clone()))
            .or_default();
        entries.push_front(outcome.clone());
        entries.truncate(self.retain);
        Ok(())
    }

    async fn recent(
        &self,
        agent_id: &str,
        capability: &str,
        limit: usize,
    ) -> MeshResult<Vec<OutcomeRecord>> {
        let history = self.history.read();
        Ok(history
            .get(&(agent_id.to_string(), capability.to_string()))
            .map(|entries| entries.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

/// SQLite-backed history (`task_outcomes` table), pruned per pair on insert.
#[derive(Clone)]
pub struct SqliteOutcomeStore {
    db: Database,
    retain: usize,
}

impl SqliteOutcomeStore {
    /// A store over the shared connection.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            retain: DEFAULT_RETAINED_OUTCOMES,
        }
    }

    /// Keep at most `retain` rows per pair, never fewer than one.
    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }
}

#[async_trait]
impl OutcomeStore for SqliteOutcomeStore {
    async fn record(&self, outcome: &OutcomeRecord) -> MeshResult<()> {
        let outcome = outcome.clone();
        let retain = i64::try_from(self.retain).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO task_outcomes
                        (agent_id, capability, task_id, success, duration_ms, recorded_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        outcome.agent_id,
                        outcome.capability,
                        outcome.task_id.to_string(),
                        outcome.success,
                        i64::try_from(outcome.duration_ms).unwrap_or(i64::MAX),
                        outcome.recorded_at.timestamp_millis(),
                    ],
                )?;
                conn.execute(
                    "DELETE FROM task_outcomes
                     WHERE agent_id = ?1 AND capability = ?2 AND id NOT IN (
                         SELECT id FROM task_outcomes
                         WHERE agent_id = ?1 AND capability = ?2
                         ORDER BY id DESC LIMIT ?3
                     )",
                    params![outcome.agent_id, outcome.capability, retain],
                )
            })
            .await?;
        Ok(())
    }

    async fn recent(
        &self,
        agent_id: &str,
        capability: &str,
        limit: usize,
    ) -> MeshResult<Vec<OutcomeRecord>> {
        let agent_id = agent_id.to_string();
        let capability = capability.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let raw = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent_id, capability, task_id, success, duration_ms, recorded_at_ms
                     FROM task_outcomes
                     WHERE agent_id = ?1 AND capability = ?2
                     ORDER BY id DESC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![agent_id, capability, limit], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, bool>(3)?,
                        r.get::<_, i64>(4)?,
                        r.get::<_, i64>(5)?,
                    ))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        raw.into_iter()
            .map(
                |(agent_id, capability, task_id, success, duration_ms, recorded_at_ms)| {
                    Ok(OutcomeRecord {
                        task_id: Uuid::parse_str(&task_id).map_err(|e| {
                            MeshError::Persistence(format!("outcome has invalid task_id: {e}"))
                        })?,
                        recorded_at: DateTime::from_timestamp_millis(recorded_at_ms)
                            .unwrap_or_default(),
                        duration_ms: u64::try_from(duration_ms).unwrap_or_default(),
                        agent_id,
                        capability,
                        success,
                    })
                },
            )
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn outcome(agent: &str, success: bool) -> OutcomeRecord {
        OutcomeRecord {
            agent_id: agent.into(),
            capability: "code-review".into(),
            task_id: Uuid::new_v4(),
            success,
            duration_ms: 100,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_newest_first_and_bounded() {
        let store = MemoryOutcomeStore::with_retention(3);
        for success in [true, true, false, false] {
            store.record(&outcome("a", success)).await.unwrap();
        }
        let recent = store.recent("a", "code-review", 10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert!(!recent[0].success);
        assert!(!recent[1].success);
        assert!(recent[2].success);
        assert_eq!(store.total(), 3);
    }

    #[tokio::test]
    async fn test_memory_pairs_are_isolated() {
        let store = MemoryOutcomeStore::new();
        store.record(&outcome("a", true)).await.unwrap();
        assert!(store.recent("b", "code-review", 10).await.unwrap().is_empty());
        assert!(store.recent("a", "summarize", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_recent_and_prune() {
        let store = SqliteOutcomeStore::new(Database::in_memory().unwrap()).with_retention(2);
        store.record(&outcome("a", true)).await.unwrap();
        store.record(&outcome("a", false)).await.unwrap();
        store.record(&outcome("a", true)).await.unwrap();
        store.record(&outcome("b", false)).await.unwrap();

        let recent = store.recent("a", "code-review", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].success);
        assert!(!recent[1].success);

        let limited = store.recent("a", "code-review", 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        assert_eq!(store.recent("b", "code-review", 10).await.unwrap().len(), 1);
    }
}
