use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::Json;
use serde_json::{json, Value};

use super::dto::progress_to_json;
use crate::handlers::utils::{parse_job_id, parse_positive_usize};
use crate::{error::ApiError, state::AppState};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// GET /jobs/{id}/progress
/// The most recent progress records of a job, oldest first.
pub async fn progress(
    Extension(state): Extension<Arc<AppState>>,
    Path(raw_id): Path<String>,
    query: Result<Query<HashMap<String, String>>, axum::extract::rejection::QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_job_id(&raw_id)?;
    let params = query.ok().map(|value| value.0).unwrap_or_default();
    let limit = parse_positive_usize(params.get("limit"), DEFAULT_LIMIT, "limit")?.min(MAX_LIMIT);

    if state.job_queue.get_job(id).await?.is_none() {
        return Err(ApiError::not_found(format!("job {id}")));
    }

    let records = state.job_queue.list_progress(id, limit).await?;
    let items: Vec<Value> = records.iter().map(progress_to_json).collect();
    Ok(Json(json!({ "jobId": id, "items": items })))
}
