use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde_json::{json, Value};

use crate::handlers::utils::parse_job_id;
use crate::{error::ApiError, state::AppState};

/// DELETE /jobs/{id}
pub async fn delete(
    Extension(state): Extension<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_job_id(&raw_id)?;
    if !state.job_queue.delete_job(id).await? {
        return Err(ApiError::not_found(format!("job {id}")));
    }
    Ok(Json(json!({ "deleted": true })))
}
