use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::Value;

use super::dto::job_to_json;
use crate::handlers::utils::parse_job_id;
use crate::{error::ApiError, state::AppState};

/// GET /jobs/{id}
pub async fn get(
    Extension(state): Extension<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_job_id(&raw_id)?;
    let job = state
        .job_queue
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))?;
    Ok(Json(job_to_json(&job)))
}
