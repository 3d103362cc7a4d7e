//! Task orchestration engine: agent registry, scoring and task lifecycle.
//!
//! Agents register capabilities and heartbeat through the [`AgentRegistry`].
//! For each submission the [`Orchestrator`] asks the registry for live
//! candidates, ranks them with the [`AgentScorer`], publishes the request on
//! the winner's topic and tracks the attempt until a result or its timer
//! arrives, retrying elsewhere on failure and checkpointing in-flight work
//! for crash recovery.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Dispatch, timeout, retry, recovery and shutdown.
//! - [`AgentRegistry`]: Key/value-backed directory of agent registrations.
//! - [`AgentScorer`]: Health- and history-weighted candidate ranking.
//! - [`MessageBus`]: Publish side of the bus ([`InMemoryBus`], [`SidecarBus`]).
//! - [`HealthChecker`]: Dependency health summaries for scoring.
//! - [`TraceSink`]: Non-blocking task lifecycle trace.

/// Message bus implementations.
pub mod bus;
/// Task lifecycle engine.
pub mod engine;
/// Dependency health probing.
pub mod health;
/// Agent registry.
pub mod registry;
/// Candidate scoring and outcome recording.
pub mod scorer;
/// Task lifecycle trace sink.
pub mod trace;

pub use bus::{
    agent_topic, unwrap_cloud_event, InMemoryBus, MessageBus, SidecarBus, DEFAULT_RESULTS_TOPIC,
};
pub use engine::{
    best_effort, DispatchReceipt, DropReason, Orchestrator, OrchestratorConfig,
    ResultDisposition,
};
pub use health::{HealthChecker, HttpHealthChecker, StaticHealth};
pub use registry::AgentRegistry;
pub use scorer::{final_score, AgentScoreCard, AgentScorer, ScorerConfig};
pub use trace::{TraceEvent, TraceKind, TraceSink};
