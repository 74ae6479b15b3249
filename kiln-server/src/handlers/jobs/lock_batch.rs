use std::sync::Arc;

use axum::extract::{Extension, Json};
use serde_json::{json, Value};

use super::dto::LockBatch;
use crate::validation::ensure_valid;
use crate::{error::ApiError, state::AppState};

/// POST /jobs/batches/lock
/// Stamp one batch id on the completed, unbatched jobs of a group.
pub async fn lock_batch(
    Extension(state): Extension<Arc<AppState>>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let Json(payload) = body.ok_or_else(|| ApiError::bad_request("missing request body"))?;
    let dto: LockBatch = serde_json::from_value(payload)?;
    ensure_valid(&dto.validate())?;

    let group_key = dto.group_key.unwrap_or_default();
    let lock = state.job_queue.lock_batch(&group_key, dto.batch_id).await?;

    Ok(Json(json!({
        "groupKey": group_key.trim(),
        "batchId": lock.batch_id,
        "lockedCount": lock.locked_count,
    })))
}
