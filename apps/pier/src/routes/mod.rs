mod auth;
mod realtime;
mod servers;
mod signed;
mod tenants;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::{
    ports::PortError,
    provision::ProvisionError,
    proxy::ProxyError,
    state::AppState,
    store::StoreError,
    supervisor::SupervisorError,
};

pub use auth::OperatorAuth;
pub use realtime::*;
pub use servers::*;
pub use signed::*;
pub use tenants::*;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/tenants", post(create_tenant).get(list_tenants))
        .route("/tenants/:port/domain", patch(change_domain))
        .route("/servers", get(list_servers))
        .route("/servers/usage", get(usage))
        .route("/servers/stop-all", post(stop_all_servers))
        .route("/servers/:port/start", post(start_server))
        .route("/servers/:port/stop", post(stop_server))
        .route("/servers/:port/restart", post(restart_server))
        .route("/realtime/stats", get(realtime_stats))
        .route("/tenant/information", get(tenant_information))
        .route("/tenant/tickets", post(submit_ticket))
        .route("/tenant/tickets/status", post(update_ticket_status))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg)),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg)),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", Some(msg))
            }
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::DuplicatePort(_) => ApiError::Conflict(err.to_string()),
            StoreError::UnknownPort(_) => ApiError::NotFound(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SupervisorError::AlreadyRunning(_) | SupervisorError::Busy(_) => {
                ApiError::Conflict(err.to_string())
            }
            SupervisorError::Store(err) => err.into(),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::InvalidName | ProvisionError::Proxy(ProxyError::InvalidDomain(_)) => {
                ApiError::BadRequest(err.to_string())
            }
            ProvisionError::UnknownTenant(_) => ApiError::NotFound(err.to_string()),
            ProvisionError::Port(PortError::Exhausted) => ApiError::Conflict(err.to_string()),
            ProvisionError::Port(PortError::Store(err)) | ProvisionError::Store(err) => err.into(),
            ProvisionError::StartFailed { .. } => ApiError::Internal(err.to_string()),
            ProvisionError::Proxy(ProxyError::Io { .. }) => ApiError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Cli, PierConfig},
        registry::TenantKey,
        store::{tenant, MemoryTenantStore, TenantStore},
    };
    use axum::{
        body::{self, Body},
        http::Request,
    };
    use clap::Parser;
    use pier_trust::{SignedEnvelope, HEADER_PORT, HEADER_SIGNATURE, HEADER_TIMESTAMP};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn test_state(sites: &std::path::Path, extra: &[&str]) -> AppState {
        let sites = sites.to_string_lossy().into_owned();
        let mut args = vec![
            "pier",
            "--proxy-sites-dir",
            sites.as_str(),
            "--proxy-reload-command",
            "",
        ];
        args.extend_from_slice(extra);
        let config = PierConfig::try_from(Cli::try_parse_from(args).unwrap()).unwrap();
        let store: Arc<dyn TenantStore> =
            Arc::new(MemoryTenantStore::with_tenants([tenant(1001, "alpha")]).unwrap());
        AppState::new(&config, store, None)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn signed_get(uri: &str, envelope: &SignedEnvelope) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(HEADER_PORT, envelope.port.to_string())
            .header(HEADER_TIMESTAMP, envelope.timestamp.to_string())
            .header(HEADER_SIGNATURE, envelope.signature.as_str())
            .body(Body::empty())
            .unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path(), &[]));
        let (status, body) = send(
            &router,
            Request::builder().uri("/healthz").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[test_timeout::tokio_timeout_test]
    async fn operator_routes_require_configured_token() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path(), &["--operator-token", "s3cret"]));

        let (status, body) = send(
            &router,
            Request::builder().uri("/tenants").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
        assert!(body["message"].is_null());

        let (status, body) = send(
            &router,
            Request::builder()
                .uri("/tenants")
                .header(header::AUTHORIZATION, "Bearer s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["port"], 1001);
        assert!(body[0].get("secret").is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn signed_information_accepts_headers_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path(), &[]));
        let envelope = SignedEnvelope::sign_now("secret-1001", 1001);

        let (status, body) = send(&router, signed_get("/tenant/information", &envelope)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "alpha");

        let uri = format!(
            "/tenant/information?port={}&timestamp={}&signature={}",
            envelope.port, envelope.timestamp, envelope.signature
        );
        let (status, body) = send(
            &router,
            Request::builder().uri(uri).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["domain"], "alpha.localhost");
    }

    #[test_timeout::tokio_timeout_test]
    async fn signed_routes_reject_without_detail() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path(), &[]));

        let forged = SignedEnvelope::sign_now("wrong-secret", 1001);
        let stale = SignedEnvelope::sign_at("secret-1001", 1001, 0);
        let unknown = SignedEnvelope::sign_now("secret-1001", 1002);
        for envelope in [&forged, &stale, &unknown] {
            let (status, body) = send(&router, signed_get("/tenant/information", envelope)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert!(body["message"].is_null());
        }

        let (status, _) = send(
            &router,
            Request::builder()
                .uri("/tenant/information")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test_timeout::tokio_timeout_test]
    async fn zero_padded_timestamp_is_not_reformatted() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path(), &[]));
        let envelope = SignedEnvelope::sign_now("secret-1001", 1001);

        let padded = format!(
            "/tenant/information?port={}&timestamp=0{}&signature={}",
            envelope.port, envelope.timestamp, envelope.signature
        );
        let (status, _) = send(
            &router,
            Request::builder().uri(padded).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/tenant/information")
            .header(HEADER_PORT, "01001")
            .header(HEADER_TIMESTAMP, envelope.timestamp.to_string())
            .header(HEADER_SIGNATURE, envelope.signature.as_str())
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test_timeout::tokio_timeout_test]
    async fn ticket_with_body_auth_reaches_admins_without_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]);
        let router = build_router(state.clone());

        let mut outbox = state.gateway.attach("admin-sock");
        state
            .gateway
            .registry()
            .add_admin(&TenantKey::from(1001u16), "admin-sock", "ops@alpha.test");

        let envelope = SignedEnvelope::sign_now("secret-1001", 1001);
        let body = json!({
            "id": "T-1",
            "subject": "printer on fire",
            "__auth": envelope,
        });
        let (status, reply) = send(
            &router,
            Request::builder()
                .method("POST")
                .uri("/tenant/tickets")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["delivered"], 1);

        let frame: Value = serde_json::from_str(&outbox.try_recv().unwrap()).unwrap();
        assert_eq!(frame["event"], "admin:new-ticket");
        assert_eq!(frame["data"]["id"], "T-1");
        assert!(frame["data"].get("__auth").is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn ticket_status_notifies_admins_and_client() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &[]);
        let router = build_router(state.clone());
        let key = TenantKey::from(1001u16);

        let mut admin = state.gateway.attach("admin-sock");
        state
            .gateway
            .registry()
            .add_admin(&key, "admin-sock", "ops@alpha.test");
        let mut client = state.gateway.attach("client-sock");
        state
            .gateway
            .registry()
            .add_client(&key, "+15550001", "client-sock");

        let envelope = SignedEnvelope::sign_now("secret-1001", 1001);
        let mut request = signed_get("/tenant/tickets/status", &envelope);
        *request.method_mut() = axum::http::Method::POST;
        *request.body_mut() = Body::from(
            json!({ "ticket": { "id": "T-1", "status": "closed" }, "customerPhone": "+15550001" })
                .to_string(),
        );
        let (status, reply) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["adminsNotified"], 1);
        assert_eq!(reply["clientNotified"], true);

        let admin_frame: Value = serde_json::from_str(&admin.try_recv().unwrap()).unwrap();
        assert_eq!(admin_frame["event"], "admin:ticket-update");
        let client_frame: Value = serde_json::from_str(&client.try_recv().unwrap()).unwrap();
        assert_eq!(client_frame["event"], "client:update-status");
        assert_eq!(client_frame["data"]["status"], "closed");
    }

    #[test_timeout::tokio_timeout_test]
    async fn idle_lifecycle_requests_are_no_ops() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path(), &[]));

        for (uri, key) in [
            ("/servers/1001/stop", "outcome"),
            ("/servers/1001/restart", "outcome"),
        ] {
            let (status, body) = send(
                &router,
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body[key], "not_running");
        }

        let (status, body) = send(
            &router,
            Request::builder()
                .method("POST")
                .uri("/servers/stop-all")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stopped"], 0);

        let (_, body) = send(
            &router,
            Request::builder().uri("/servers").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body, json!([]));
    }

    #[test_timeout::tokio_timeout_test]
    async fn starting_unknown_tenant_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path(), &[]));
        let (status, body) = send(
            &router,
            Request::builder()
                .method("POST")
                .uri("/servers/4242/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejects_domains_that_are_not_hostnames() {
        let dir = tempfile::tempdir().unwrap();
        let router = build_router(test_state(dir.path(), &[]));
        let (status, body) = send(
            &router,
            Request::builder()
                .method("PATCH")
                .uri("/tenants/1001/domain")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "domain": "evil.test; include /etc/passwd" }).to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }
}
