use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;
use serde_json::{json, Value};

use crate::{error::ApiError, state::AppState};

/// POST /jobs/purge-completed
/// Delete every completed job. Failed jobs are kept for inspection.
pub async fn purge_completed(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let purged = state.job_queue.purge_completed().await?;
    Ok(Json(json!({ "purged": purged })))
}
