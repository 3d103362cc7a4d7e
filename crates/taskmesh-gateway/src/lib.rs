//! HTTP control plane for taskmesh.
//!
//! Exposes task submission and status, the agent registry, score previews and
//! the bus result route over axum, with optional API-key authentication.

/// Mapping of [`taskmesh_core::MeshError`] onto HTTP responses.
pub mod error;
/// API-key middleware.
pub mod middleware;
/// Route handlers.
pub mod routes;
/// Router assembly and shared state.
pub mod server;

pub use error::{ApiError, ApiResult};
pub use middleware::{AuthConfig, SIDECAR_TOKEN_HEADER};
pub use routes::{Subscription, RESULTS_ROUTE, SUBSCRIBE_ROUTE, SUBSCRIPTIONS_ROUTE};
pub use server::{AppState, GatewayServer, DEFAULT_PUBSUB_NAME};
