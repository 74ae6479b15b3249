use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Extension},
    http::{header, Request},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};

use crate::error::ApiError;
use crate::handlers::{health, jobs};
use crate::state::AppState;

// Payloads are prompts plus metadata; 2 MB leaves room for long prompts.
const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Build the primary axum router with the provided shared application state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let job_routes = Router::new()
        .route("/jobs", post(jobs::enqueue::enqueue).get(jobs::list::list))
        .route("/jobs/stats", get(jobs::stats::stats))
        .route(
            "/jobs/purge-completed",
            post(jobs::purge::purge_completed),
        )
        .route("/jobs/batches/lock", post(jobs::lock_batch::lock_batch))
        .route(
            "/jobs/{id}",
            get(jobs::get::get).delete(jobs::delete::delete),
        )
        .route("/jobs/{id}/progress", get(jobs::progress::progress))
        .route("/jobs/{id}/retry", post(jobs::retry::retry))
        .route_layer(middleware::from_fn(require_admin_token));

    let router = Router::new()
        .merge(job_routes)
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .layer(DefaultBodyLimit::max(DEFAULT_BODY_LIMIT))
        .layer(Extension(state));

    Router::new().nest("/api", router)
}

/// Reject job routes without the configured bearer token. A no-op when no
/// token is configured.
async fn require_admin_token(
    Extension(state): Extension<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token() else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            next.run(req).await
        }
        _ => {
            tracing::debug!(path = %req.uri().path(), "rejected request without valid admin token");
            ApiError::Unauthorized.into_response()
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
