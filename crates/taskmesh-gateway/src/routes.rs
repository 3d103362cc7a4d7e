use crate::error::ApiResult;
use crate::server::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use taskmesh_core::{AgentRegistration, MeshError, TaskSubmission};
use tracing::{debug, info};
use uuid::Uuid;

/// Route the results topic is delivered to.
pub const RESULTS_ROUTE: &str = "/results";

/// Route a Dapr sidecar reads programmatic subscriptions from at startup.
pub const SUBSCRIBE_ROUTE: &str = "/dapr/subscribe";

/// Same document as [`SUBSCRIBE_ROUTE`], kept for operators.
pub const SUBSCRIPTIONS_ROUTE: &str = "/subscriptions";

/// One entry of the subscription discovery document.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    /// Pub/sub component name on the sidecar.
    pub pubsubname: String,
    /// Topic carrying agent results.
    pub topic: String,
    /// Route the sidecar POSTs each message to.
    pub route: String,
}

fn parse_body(body: &Bytes, what: &str) -> Result<Value, MeshError> {
    serde_json::from_slice(body)
        .map_err(|e| MeshError::Validation(format!("malformed {what} body: {e}")))
}

pub(crate) async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "taskmesh",
        "trackedTasks": state.orchestrator.tracked_count(),
    }))
}

pub(crate) async fn submit_task(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let submission = TaskSubmission::from_value(parse_body(&body, "task submission")?)?;
    let receipt = state.orchestrator.submit(submission).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub(crate) async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task_id = Uuid::parse_str(&id)
        .map_err(|_| MeshError::Validation(format!("'{id}' is not a task id")))?;
    match state.orchestrator.get_task(task_id).await {
        Some(status) => Ok(Json(status)),
        None => Err(MeshError::NotFound(format!("task {task_id}")).into()),
    }
}

pub(crate) async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.list_agents().await?))
}

pub(crate) async fn score_capability(
    State(state): State<Arc<AppState>>,
    Path(capability): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.preview_scores(&capability).await?))
}

pub(crate) async fn register_agent(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let reg: AgentRegistration = serde_json::from_value(parse_body(&body, "registration")?)
        .map_err(|e| MeshError::Validation(format!("malformed registration: {e}")))?;
    let stored = state.orchestrator.registry().register(reg).await?;
    info!(app_id = %stored.app_id, "Agent registered over HTTP");
    Ok((StatusCode::CREATED, Json(stored)))
}

pub(crate) async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    match state.orchestrator.registry().get(&app_id).await? {
        Some(reg) => Ok(Json(reg)),
        None => Err(MeshError::NotFound(format!("agent {app_id}")).into()),
    }
}

pub(crate) async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let known = state.orchestrator.registry().heartbeat(&app_id).await?;
    Ok(Json(json!({ "acknowledged": true, "known": known })))
}

pub(crate) async fn deregister_agent(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.registry().deregister(&app_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn mark_offline(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.orchestrator.registry().mark_offline(&app_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(MeshError::NotFound(format!("agent {app_id}")).into())
    }
}

/// Result delivery from the bus. Always 200 so the sidecar never redelivers.
pub(crate) async fn deliver_result(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> impl IntoResponse {
    let disposition = match serde_json::from_slice::<Value>(&body) {
        Ok(value) => Some(state.orchestrator.handle_result_value(value).await),
        Err(e) => {
            debug!(error = %e, "Dropping unparseable result delivery");
            None
        }
    };
    let status = match disposition {
        Some(d) if d.is_accepted() => "SUCCESS",
        _ => "DROP",
    };
    Json(json!({ "status": status }))
}

pub(crate) async fn subscriptions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(vec![Subscription {
        pubsubname: state.pubsub_name.clone(),
        topic: state.results_topic.clone(),
        route: RESULTS_ROUTE.to_string(),
    }])
}
