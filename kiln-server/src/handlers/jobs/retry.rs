use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::Value;

use super::dto::job_to_json;
use crate::handlers::utils::parse_job_id;
use crate::{error::ApiError, state::AppState};

/// POST /jobs/{id}/retry
/// Return a completed or failed job to pending.
pub async fn retry(
    Extension(state): Extension<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_job_id(&raw_id)?;
    let job = state
        .job_queue
        .retry_job(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))?;
    Ok(Json(job_to_json(&job)))
}
