//! Core types and error definitions for the taskmesh scheduler.
//!
//! This crate provides the types shared across all taskmesh crates: agent
//! registrations and their liveness rules, the task envelopes exchanged over
//! the message bus, and the unified error type.
//!
//! # Main types
//!
//! - [`MeshError`]: Unified error enum for all taskmesh subsystems.
//! - [`MeshResult`]: Convenience alias for `Result<T, MeshError>`.
//! - [`AgentRegistration`]: An agent's advertised identity and capabilities.
//! - [`AgentStatus`]: Liveness derived from heartbeat age.
//! - [`TaskRequest`]: The envelope published to an agent's topic.
//! - [`TaskResult`]: The envelope an agent publishes back per attempt.
//! - [`TaskStatus`]: The scheduler's view of an in-flight task.

/// Agent registration and liveness types.
pub mod agent;
/// Error types.
pub mod error;
/// Task envelopes and lifecycle state.
pub mod task;

pub use agent::{AgentCapability, AgentRegistration, AgentStatus, Metadata};
pub use error::{MeshError, MeshResult};
pub use task::{
    Payload, TaskError, TaskRequest, TaskResult, TaskState, TaskStatus, TaskSubmission,
    DEFAULT_PRIORITY, DEFAULT_TIMEOUT_SECS, MAX_ATTEMPTS, MAX_PRIORITY,
};
