use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::Json;
use kiln_job_queue::{JobFilter, JobStatus};
use serde_json::{json, Value};

use super::dto::job_to_json;
use crate::handlers::utils::{non_empty, parse_non_negative_usize, parse_positive_usize};
use crate::{error::ApiError, state::AppState};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// GET /jobs
/// List jobs newest first with optional filtering and pagination.
pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
    query: Result<Query<HashMap<String, String>>, axum::extract::rejection::QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let params = query.ok().map(|value| value.0).unwrap_or_default();
    let limit = parse_positive_usize(params.get("limit"), DEFAULT_LIMIT, "limit")?.min(MAX_LIMIT);
    let offset = parse_non_negative_usize(params.get("offset"), "offset")?;
    let status = non_empty(params.get("status"))
        .map(str::parse::<JobStatus>)
        .transpose()?;

    let filter = JobFilter {
        status,
        job_type: non_empty(params.get("type")).map(str::to_owned),
        group_key: non_empty(params.get("groupKey")).map(str::to_owned),
        batch_id: non_empty(params.get("batchId")).map(str::to_owned),
        limit,
        offset,
    };

    let total = state.job_queue.count_jobs(&filter).await?;
    let jobs = state.job_queue.list_jobs(&filter).await?;
    let items: Vec<Value> = jobs.iter().map(job_to_json).collect();

    Ok(Json(json!({
        "items": items,
        "pagination": {
            "limit": limit,
            "offset": offset,
            "total": total,
        }
    })))
}
