use api_state::ApiState;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post},
    Router,
};
use routes::{
    liveness::live,
    readiness::ready,
    sessions::{get_session_status, list_store_sessions, submit_document},
};

pub mod api_state;
pub mod error;
mod routes;

pub use routes::sessions::SubmitDocumentResponse;

/// Room for multipart boundaries and the small text fields next to the document.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Health checks for k8s/systemd
    let health_checks = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    let body_limit = app_state
        .config
        .ingest_max_document_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let sessions = Router::new()
        .route(
            "/sessions",
            post(submit_document).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/sessions/{id}", get(get_session_status))
        .route("/stores/{store_id}/sessions", get(list_store_sessions));

    health_checks.merge(sessions)
}
