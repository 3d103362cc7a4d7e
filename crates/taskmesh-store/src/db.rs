use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use taskmesh_core::{MeshError, MeshResult};
use tracing::info;

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS task_checkpoints (
    task_id          TEXT PRIMARY KEY,
    capability       TEXT NOT NULL,
    dispatched_to    TEXT NOT NULL,
    dispatched_at_ms INTEGER NOT NULL,
    status           TEXT NOT NULL,
    attempts         INTEGER NOT NULL,
    generation       INTEGER NOT NULL,
    timeout_seconds  INTEGER NOT NULL,
    priority         INTEGER NOT NULL,
    requested_by     TEXT NOT NULL,
    created_at_ms    INTEGER NOT NULL,
    payload          TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS task_outcomes (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id       TEXT NOT NULL,
    capability     TEXT NOT NULL,
    task_id        TEXT NOT NULL,
    success        INTEGER NOT NULL,
    duration_ms    INTEGER NOT NULL,
    recorded_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_outcomes_pair
    ON task_outcomes(agent_id, capability, id);
";

/// Shared SQLite handle for the checkpoint and outcome tables.
///
/// Cloning shares the connection. [`Database::close`] releases it for every
/// clone; later calls fail with [`MeshError::Persistence`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Database {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> MeshResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| {
            MeshError::Persistence(format!("failed to open {}: {e}", path.display()))
        })?;
        // WAL keeps checkpoint writes from blocking recovery reads.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let db = Self::from_connection(conn)?;
        info!(path = %path.display(), "Opened checkpoint database");
        Ok(db)
    }

    /// A private in-memory database, used by tests.
    pub fn in_memory() -> MeshResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MeshError::Persistence(format!("failed to open in-memory db: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> MeshResult<Self> {
        conn.execute_batch(CREATE_SCHEMA_SQL)
            .map_err(|e| MeshError::Persistence(format!("failed to apply schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> MeshResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| MeshError::Persistence("database is closed".into()))?;
            f(conn).map_err(|e| MeshError::Persistence(e.to_string()))
        })
        .await
        .map_err(|e| MeshError::Persistence(format!("database worker failed: {e}")))?
    }

    /// Drop the connection. Idempotent.
    pub fn close(&self) {
        if self.conn.lock().take().is_some() {
            info!("Closed checkpoint database");
        }
    }

    /// Whether [`Database::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }
}
