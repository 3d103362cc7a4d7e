//! Storage backends for taskmesh.
//!
//! Three independent concerns live here, each behind an async trait so the
//! scheduler can run against in-memory fakes in tests:
//!
//! - [`KvStore`]: plain get/save/delete used by the agent registry.
//! - [`CheckpointStore`]: one row per in-flight task, for crash recovery.
//! - [`OutcomeStore`]: bounded per-agent outcome history feeding the scorer.
//!
//! The SQLite implementations share a single [`Database`] handle.

/// Checkpoint rows and stores.
pub mod checkpoint;
/// Shared SQLite connection.
pub mod db;
/// Key/value stores.
pub mod kv;
/// Outcome history stores.
pub mod outcome;

pub use checkpoint::{CheckpointRow, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use db::Database;
pub use kv::{FileKvStore, KvStore, MemoryKvStore};
pub use outcome::{
    MemoryOutcomeStore, OutcomeRecord, OutcomeStore, SqliteOutcomeStore, DEFAULT_RETAINED_OUTCOMES,
};
