use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::state::AppState;

/// GET /health
/// Liveness: always 200 while the process is up.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /ready
/// Readiness: the job store must answer.
pub async fn ready(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    match state.job_queue.ping().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(error) => {
            tracing::warn!(%error, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "job store unavailable")
        }
    }
}
