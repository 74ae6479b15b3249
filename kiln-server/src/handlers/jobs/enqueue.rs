use std::sync::Arc;

use axum::extract::{Extension, Json};
use axum::http::StatusCode;
use kiln_job_queue::format_timestamp;
use serde_json::{json, Value};

use super::dto::EnqueueJob;
use crate::validation::ensure_valid;
use crate::{error::ApiError, state::AppState};

/// POST /jobs
/// Enqueue a job. A repeated idempotency key returns the existing job with 200.
pub async fn enqueue(
    Extension(state): Extension<Arc<AppState>>,
    body: Option<Json<Value>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(payload) = body.ok_or_else(|| ApiError::bad_request("missing request body"))?;
    let dto: EnqueueJob = serde_json::from_value(payload)?;
    ensure_valid(&dto.validate())?;

    let outcome = state.job_queue.enqueue(dto.into_request()).await?;
    let status = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(json!({
            "id": outcome.job.id,
            "status": outcome.job.status.as_str(),
            "createdAt": format_timestamp(&outcome.job.created_at),
            "deduplicated": outcome.deduplicated,
        })),
    ))
}
