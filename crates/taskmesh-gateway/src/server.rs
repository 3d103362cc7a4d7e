use crate::middleware::{auth_middleware, AuthConfig};
use crate::routes::{self, RESULTS_ROUTE, SUBSCRIBE_ROUTE, SUBSCRIPTIONS_ROUTE};
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use taskmesh_orchestrator::{Orchestrator, DEFAULT_RESULTS_TOPIC};
use tower::ServiceBuilder;

/// Default pub/sub component name advertised on `/dapr/subscribe`.
pub const DEFAULT_PUBSUB_NAME: &str = "pubsub";

/// Shared application state.
pub struct AppState {
    /// The scheduler every handler drives.
    pub orchestrator: Orchestrator,
    /// Pub/sub component advertised in the subscription document.
    pub pubsub_name: String,
    /// Topic agents publish results on.
    pub results_topic: String,
}

impl AppState {
    /// State with the default pub/sub name and results topic.
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            pubsub_name: DEFAULT_PUBSUB_NAME.to_string(),
            results_topic: DEFAULT_RESULTS_TOPIC.to_string(),
        }
    }

    /// Override the advertised subscription.
    pub fn with_subscription(
        mut self,
        pubsub_name: impl Into<String>,
        results_topic: impl Into<String>,
    ) -> Self {
        self.pubsub_name = pubsub_name.into();
        self.results_topic = results_topic.into();
        self
    }
}

/// The control plane server.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway without auth.
    pub fn build(orchestrator: Orchestrator) -> Router {
        Self::build_with_auth(AppState::new(orchestrator), AuthConfig::default())
    }

    /// Build the gateway with the auth middleware when API keys or a sidecar
    /// token are configured.
    pub fn build_with_auth(state: AppState, auth_config: AuthConfig) -> Router {
        let app = Router::new()
            .route("/healthz", get(routes::health_handler))
            .route("/tasks", post(routes::submit_task))
            .route("/tasks/{id}", get(routes::get_task))
            .route(
                "/agents",
                get(routes::list_agents).post(routes::register_agent),
            )
            .route("/agents/score/{capability}", get(routes::score_capability))
            .route(
                "/agents/{app_id}",
                get(routes::get_agent).delete(routes::deregister_agent),
            )
            .route("/agents/{app_id}/heartbeat", post(routes::heartbeat))
            .route("/agents/{app_id}/offline", post(routes::mark_offline))
            .route(RESULTS_ROUTE, post(routes::deliver_result))
            .route(SUBSCRIBE_ROUTE, get(routes::subscriptions))
            .route(SUBSCRIPTIONS_ROUTE, get(routes::subscriptions))
            .with_state(Arc::new(state));

        if auth_config.is_active() {
            app.layer(ServiceBuilder::new().layer(axum_mw::from_fn_with_state(
                Arc::new(auth_config),
                auth_middleware,
            )))
        } else {
            app
        }
    }
}
