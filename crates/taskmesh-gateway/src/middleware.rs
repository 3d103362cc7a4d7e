use crate::routes::{RESULTS_ROUTE, SUBSCRIBE_ROUTE, SUBSCRIPTIONS_ROUTE};
use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Paths reachable without an API key.
pub const PUBLIC_PATHS: &[&str] = &["/healthz"];

/// Paths called by the pub/sub sidecar rather than by API clients. They never
/// take an API key; when a sidecar token is configured they require it instead.
pub const SIDECAR_PATHS: &[&str] = &[RESULTS_ROUTE, SUBSCRIBE_ROUTE, SUBSCRIPTIONS_ROUTE];

/// Header a Dapr sidecar sets when `APP_API_TOKEN` is configured.
pub const SIDECAR_TOKEN_HEADER: &str = "dapr-api-token";

/// Auth configuration for the gateway.
#[derive(Clone, Default)]
pub struct AuthConfig {
    /// API keys that are allowed to call the control plane. Empty = no auth required.
    pub api_keys: Vec<String>,
    /// Token the sidecar must present on [`SIDECAR_PATHS`]. `None` leaves them open.
    pub sidecar_token: Option<String>,
}

impl AuthConfig {
    /// API-key auth with the sidecar routes left open.
    pub fn new(api_keys: Vec<String>) -> Self {
        Self {
            api_keys,
            sidecar_token: None,
        }
    }

    /// Require `token` in [`SIDECAR_TOKEN_HEADER`] on the sidecar routes.
    pub fn with_sidecar_token(mut self, token: impl Into<String>) -> Self {
        self.sidecar_token = Some(token.into());
        self
    }

    /// Returns true if authentication is enabled (at least one key configured).
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    /// Whether the middleware has anything to check.
    pub fn is_active(&self) -> bool {
        self.is_enabled() || self.sidecar_token.is_some()
    }

    /// Whether `candidate` matches one of the configured keys.
    pub fn accepts(&self, candidate: &str) -> bool {
        self.api_keys.iter().any(|k| keys_match(k, candidate))
    }
}

/// Constant-time key comparison.
pub fn keys_match(expected: &str, candidate: &str) -> bool {
    let a = expected.as_bytes();
    let b = candidate.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Auth middleware: validates the API key from header or query param.
///
/// Checks `Authorization: Bearer <key>` first, then `?api_key=<key>`.
/// Liveness checks on [`PUBLIC_PATHS`] always pass. [`SIDECAR_PATHS`] are
/// gated by the sidecar token alone.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    let path = path.as_str();
    if PUBLIC_PATHS.contains(&path) {
        return next.run(request).await;
    }

    if SIDECAR_PATHS.contains(&path) {
        let Some(expected) = auth.sidecar_token.as_deref() else {
            return next.run(request).await;
        };
        let presented = headers
            .get(SIDECAR_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        return match presented {
            Some(t) if keys_match(expected, t) => next.run(request).await,
            _ => {
                warn!(path = %path, "Rejected sidecar request: bad or missing token");
                (StatusCode::UNAUTHORIZED, "Sidecar token required").into_response()
            }
        };
    }

    if !auth.is_enabled() {
        return next.run(request).await;
    }

    let key_from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    let key = key_from_header.or_else(|| query.api_key.clone());

    match key {
        Some(k) if auth.accepts(&k) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected request: invalid API key");
            (StatusCode::UNAUTHORIZED, "Invalid API key").into_response()
        }
        None => {
            warn!(path = %request.uri().path(), "Rejected request: missing API key");
            (StatusCode::UNAUTHORIZED, "API key required").into_response()
        }
    }
}

/// Query-string form of the API key.
#[derive(serde::Deserialize, Default)]
pub struct AuthQuery {
    /// `?api_key=<key>`.
    pub api_key: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::Request,
        middleware::from_fn_with_state,
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    fn guarded(keys: Vec<String>) -> Router {
        guarded_with(AuthConfig::new(keys))
    }

    fn guarded_with(auth: AuthConfig) -> Router {
        Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route("/agents", get(|| async { "[]" }))
            .route(RESULTS_ROUTE, post(|| async { "ok" }))
            .route(SUBSCRIBE_ROUTE, get(|| async { "[]" }))
            .layer(from_fn_with_state(Arc::new(auth), auth_middleware))
    }

    async fn status_of(app: Router, req: Request<Body>) -> StatusCode {
        app.oneshot(req).await.unwrap().status()
    }

    #[test]
    fn test_auth_config_disabled() {
        let config = AuthConfig::new(vec![]);
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_auth_config_accepts() {
        let config = AuthConfig::new(vec!["key123".to_string()]);
        assert!(config.is_enabled());
        assert!(config.accepts("key123"));
        assert!(!config.accepts("key124"));
        assert!(!config.accepts("key12"));
    }

    #[tokio::test]
    async fn test_open_when_no_keys() {
        let req = Request::builder().uri("/agents").body(Body::empty()).unwrap();
        assert_eq!(status_of(guarded(vec![]), req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_and_invalid_keys_rejected() {
        let app = guarded(vec!["s3cret".into()]);

        let req = Request::builder().uri("/agents").body(Body::empty()).unwrap();
        assert_eq!(status_of(app.clone(), req).await, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/agents")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app, req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_header_and_query_keys_accepted() {
        let app = guarded(vec!["s3cret".into()]);

        let req = Request::builder()
            .uri("/agents")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app.clone(), req).await, StatusCode::OK);

        let req = Request::builder()
            .uri("/agents?api_key=s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app, req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_healthz_is_public() {
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        assert_eq!(
            status_of(guarded(vec!["s3cret".into()]), req).await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_sidecar_routes_skip_api_key() {
        let app = guarded(vec!["s3cret".into()]);

        let req = Request::builder()
            .method("POST")
            .uri(RESULTS_ROUTE)
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app.clone(), req).await, StatusCode::OK);

        let req = Request::builder()
            .uri(SUBSCRIBE_ROUTE)
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app, req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sidecar_token_gates_sidecar_routes_only() {
        let app = guarded_with(AuthConfig::new(vec![]).with_sidecar_token("tok"));

        let req = Request::builder()
            .method("POST")
            .uri(RESULTS_ROUTE)
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app.clone(), req).await, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .method("POST")
            .uri(RESULTS_ROUTE)
            .header(SIDECAR_TOKEN_HEADER, "wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app.clone(), req).await, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .method("POST")
            .uri(RESULTS_ROUTE)
            .header(SIDECAR_TOKEN_HEADER, "tok")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app.clone(), req).await, StatusCode::OK);

        // No API keys configured, so the control plane stays open.
        let req = Request::builder().uri("/agents").body(Body::empty()).unwrap();
        assert_eq!(status_of(app, req).await, StatusCode::OK);
    }

    #[test]
    fn test_auth_config_active_with_token_only() {
        assert!(!AuthConfig::default().is_active());
        let config = AuthConfig::default().with_sidecar_token("tok");
        assert!(config.is_active());
        assert!(!config.is_enabled());
    }
}
