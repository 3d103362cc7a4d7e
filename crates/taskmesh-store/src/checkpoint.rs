use crate::db::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use taskmesh_core::{MeshError, MeshResult, Payload, TaskState, TaskStatus};
use tracing::error;
use uuid::Uuid;

/// Durable state of one non-terminal task: enough to re-arm its timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRow {
    /// Task id.
    pub task_id: Uuid,
    /// Requested capability.
    pub capability: String,
    /// Agent holding the current attempt.
    pub dispatched_to: String,
    /// Start of the current attempt.
    pub dispatched_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: TaskState,
    /// Dispatches so far.
    pub attempts: u32,
    /// Generation of the current attempt.
    pub generation: u32,
    /// Per-attempt timeout.
    pub timeout_secs: u64,
    /// Priority, `1..=10`.
    pub priority: u8,
    /// Scheduler identity stamped on every request.
    pub requested_by: String,
    /// When the task was first submitted.
    pub created_at: DateTime<Utc>,
    /// Stored as JSON text.
    pub payload: Payload,
}

impl CheckpointRow {
    /// Snapshot the durable part of `status`.
    pub fn from_status(status: &TaskStatus) -> Self {
        Self {
            task_id: status.task_id,
            capability: status.capability.clone(),
            dispatched_to: status.dispatched_to.clone(),
            dispatched_at: status.dispatched_at,
            status: status.status,
            attempts: status.attempts,
            generation: status.generation,
            timeout_secs: status.timeout_secs,
            priority: status.priority,
            requested_by: status.requested_by.clone(),
            created_at: status.created_at,
            payload: status.payload.clone(),
        }
    }

    /// Rebuild a status. `last_error` and `result` are not persisted.
    pub fn into_status(self) -> TaskStatus {
        TaskStatus {
            task_id: self.task_id,
            capability: self.capability,
            dispatched_to: self.dispatched_to,
            dispatched_at: self.dispatched_at,
            status: self.status,
            attempts: self.attempts,
            payload: self.payload,
            generation: self.generation,
            priority: self.priority,
            timeout_secs: self.timeout_secs,
            requested_by: self.requested_by,
            created_at: self.created_at,
            last_error: None,
            result: None,
        }
    }

    /// Time left on the current attempt at `now`, floored at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let total_ms = i64::try_from(self.timeout_secs)
            .unwrap_or(i64::MAX / 1000)
            .saturating_mul(1000);
        let elapsed_ms = (now - self.dispatched_at).num_milliseconds();
        let remaining_ms = total_ms.saturating_sub(elapsed_ms).max(0);
        Duration::from_millis(remaining_ms as u64)
    }
}

/// Crash-recovery persistence for in-flight tasks.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the row for `row.task_id`.
    async fn save(&self, row: &CheckpointRow) -> MeshResult<()>;
    /// Remove a row; absent rows are not an error.
    async fn delete(&self, task_id: Uuid) -> MeshResult<()>;
    /// Every stored row, oldest dispatch first.
    async fn load_all(&self) -> MeshResult<Vec<CheckpointRow>>;
    /// Release the underlying connection.
    async fn close(&self) -> MeshResult<()>;
}

/// SQLite-backed checkpoint store (`task_checkpoints` table).
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: Database,
}

impl SqliteCheckpointStore {
    /// A store over the shared connection.
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, row: &CheckpointRow) -> MeshResult<()> {
        let payload = serde_json::to_string(&row.payload)?;
        let row = row.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO task_checkpoints (
                        task_id, capability, dispatched_to, dispatched_at_ms, status,
                        attempts, generation, timeout_seconds, priority, requested_by,
                        created_at_ms, payload
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        row.task_id.to_string(),
                        row.capability,
                        row.dispatched_to,
                        row.dispatched_at.timestamp_millis(),
                        row.status.to_string(),
                        i64::from(row.attempts),
                        i64::from(row.generation),
                        i64::try_from(row.timeout_secs).unwrap_or(i64::MAX),
                        i64::from(row.priority),
                        row.requested_by,
                        row.created_at.timestamp_millis(),
                        payload,
                    ],
                )
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, task_id: Uuid) -> MeshResult<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM task_checkpoints WHERE task_id = ?1",
                    params![task_id.to_string()],
                )
            })
            .await?;
        Ok(())
    }

    /// Rows that fail to decode are logged, deleted and left out so one
    /// corrupt checkpoint cannot block recovery of the rest.
    async fn load_all(&self) -> MeshResult<Vec<CheckpointRow>> {
        let raw = self
            .db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, capability, dispatched_to, dispatched_at_ms, status,
                            attempts, generation, timeout_seconds, priority, requested_by,
                            created_at_ms, payload
                     FROM task_checkpoints ORDER BY dispatched_at_ms",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok(RawRow {
                        task_id: r.get(0)?,
                        capability: r.get(1)?,
                        dispatched_to: r.get(2)?,
                        dispatched_at_ms: r.get(3)?,
                        status: r.get(4)?,
                        attempts: r.get(5)?,
                        generation: r.get(6)?,
                        timeout_seconds: r.get(7)?,
                        priority: r.get(8)?,
                        requested_by: r.get(9)?,
                        created_at_ms: r.get(10)?,
                        payload: r.get(11)?,
                    })
                })?;
                let mut decoded = Vec::new();
                for row in rows {
                    match row {
                        Ok(raw) => decoded.push(raw),
                        Err(e) => error!(error = %e, "Skipping unreadable checkpoint row"),
                    }
                }
                Ok(decoded)
            })
            .await?;

        let mut rows = Vec::with_capacity(raw.len());
        let mut corrupt = Vec::new();
        for r in raw {
            let task_id = r.task_id.clone();
            match r.into_row() {
                Ok(row) => rows.push(row),
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Dropping corrupt checkpoint");
                    corrupt.push(task_id);
                }
            }
        }

        if !corrupt.is_empty() {
            self.db
                .call(move |conn| {
                    for task_id in &corrupt {
                        conn.execute(
                            "DELETE FROM task_checkpoints WHERE task_id = ?1",
                            params![task_id],
                        )?;
                    }
                    Ok(())
                })
                .await?;
        }

        Ok(rows)
    }

    async fn close(&self) -> MeshResult<()> {
        self.db.close();
        Ok(())
    }
}

struct RawRow {
    task_id: String,
    capability: String,
    dispatched_to: String,
    dispatched_at_ms: i64,
    status: String,
    attempts: i64,
    generation: i64,
    timeout_seconds: i64,
    priority: i64,
    requested_by: String,
    created_at_ms: i64,
    payload: String,
}

impl RawRow {
    fn into_row(self) -> MeshResult<CheckpointRow> {
        let corrupt = |what: &str| {
            MeshError::Persistence(format!("checkpoint {}: invalid {what}", self.task_id))
        };
        Ok(CheckpointRow {
            task_id: Uuid::parse_str(&self.task_id).map_err(|_| corrupt("task_id"))?,
            dispatched_at: DateTime::from_timestamp_millis(self.dispatched_at_ms)
                .ok_or_else(|| corrupt("dispatched_at"))?,
            status: self.status.parse().map_err(|_| corrupt("status"))?,
            attempts: u32::try_from(self.attempts).map_err(|_| corrupt("attempts"))?,
            generation: u32::try_from(self.generation).map_err(|_| corrupt("generation"))?,
            timeout_secs: u64::try_from(self.timeout_seconds).map_err(|_| corrupt("timeout"))?,
            priority: u8::try_from(self.priority).map_err(|_| corrupt("priority"))?,
            created_at: DateTime::from_timestamp_millis(self.created_at_ms)
                .ok_or_else(|| corrupt("created_at"))?,
            payload: serde_json::from_str(&self.payload).map_err(|_| corrupt("payload"))?,
            capability: self.capability,
            dispatched_to: self.dispatched_to,
            requested_by: self.requested_by,
        })
    }
}

/// In-memory checkpoint store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    rows: RwLock<HashMap<Uuid, CheckpointRow>>,
}

impl MemoryCheckpointStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The row for `task_id`, if saved.
    pub fn get(&self, task_id: Uuid) -> Option<CheckpointRow> {
        self.rows.read().get(&task_id).cloned()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, row: &CheckpointRow) -> MeshResult<()> {
        self.rows.write().insert(row.task_id, row.clone());
        Ok(())
    }

    async fn delete(&self, task_id: Uuid) -> MeshResult<()> {
        self.rows.write().remove(&task_id);
        Ok(())
    }

    async fn load_all(&self) -> MeshResult<Vec<CheckpointRow>> {
        let mut rows: Vec<CheckpointRow> = self.rows.read().values().cloned().collect();
        rows.sort_by_key(|r| r.dispatched_at);
        Ok(rows)
    }

    async fn close(&self) -> MeshResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(dispatched_secs_ago: i64, timeout_secs: u64) -> CheckpointRow {
        let now = Utc::now();
        CheckpointRow {
            task_id: Uuid::new_v4(),
            capability: "code-review".into(),
            dispatched_to: "reviewer-a".into(),
            dispatched_at: now - chrono::Duration::seconds(dispatched_secs_ago),
            status: TaskState::Dispatched,
            attempts: 1,
            generation: 1,
            timeout_secs,
            priority: 5,
            requested_by: "scheduler".into(),
            created_at: now,
            payload: json!({"pr": 7}).as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_remaining_partial() {
        let r = row(90, 120);
        let remaining = r.remaining(Utc::now());
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining >= Duration::from_secs(29));
    }

    #[test]
    fn test_remaining_overdue_is_zero() {
        let r = row(600, 120);
        assert_eq!(r.remaining(Utc::now()), Duration::ZERO);
    }

    #[test]
    fn test_status_round_trip() {
        let r = row(0, 60);
        let back = CheckpointRow::from_status(&r.clone().into_status());
        assert_eq!(back, r);
    }

    #[tokio::test]
    async fn test_sqlite_save_load_delete() {
        let store = SqliteCheckpointStore::new(Database::in_memory().unwrap());
        let mut r = row(10, 120);
        store.save(&r).await.unwrap();

        // Upsert keeps a single row per task.
        r.attempts = 2;
        r.generation = 2;
        r.status = TaskState::Retrying;
        r.dispatched_to = "reviewer-b".into();
        store.save(&r).await.unwrap();

        let rows = store.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        let loaded = &rows[0];
        assert_eq!(loaded.task_id, r.task_id);
        assert_eq!(loaded.attempts, 2);
        assert_eq!(loaded.generation, 2);
        assert_eq!(loaded.status, TaskState::Retrying);
        assert_eq!(loaded.dispatched_to, "reviewer-b");
        assert_eq!(loaded.payload, r.payload);
        assert_eq!(
            loaded.dispatched_at.timestamp_millis(),
            r.dispatched_at.timestamp_millis()
        );

        store.delete(r.task_id).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
        // Deleting an absent row is fine.
        store.delete(r.task_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_row_does_not_block_load() {
        let db = Database::in_memory().unwrap();
        let store = SqliteCheckpointStore::new(db.clone());
        let good = row(10, 120);
        store.save(&good).await.unwrap();

        db.call(|conn| {
            conn.execute(
                "INSERT INTO task_checkpoints (
                    task_id, capability, dispatched_to, dispatched_at_ms, status,
                    attempts, generation, timeout_seconds, priority, requested_by,
                    created_at_ms, payload
                ) VALUES ('bad', 'code-review', 'reviewer-a', 0, 'dispatched',
                          1, 1, 60, 5, 'scheduler', 0, '{}')",
                [],
            )
        })
        .await
        .unwrap();

        let rows = store.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task_id, good.task_id);

        // The corrupt row is gone for good.
        let remaining: i64 = db
            .call(|conn| {
                conn.query_row("SELECT COUNT(*) FROM task_checkpoints", [], |r| r.get(0))
            })
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn test_sqlite_closed_store_errors() {
        let store = SqliteCheckpointStore::new(Database::in_memory().unwrap());
        store.close().await.unwrap();
        assert!(matches!(
            store.save(&row(0, 10)).await,
            Err(MeshError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        let r = row(5, 30);
        store.save(&r).await.unwrap();
        assert_eq!(store.get(r.task_id), Some(r.clone()));
        assert_eq!(store.load_all().await.unwrap().len(), 1);
        store.delete(r.task_id).await.unwrap();
        assert!(store.is_empty());
    }
}
