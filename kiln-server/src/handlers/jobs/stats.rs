use std::sync::Arc;

use axum::extract::Extension;
use axum::Json;
use serde_json::{json, Value};

use crate::{error::ApiError, state::AppState};

/// GET /jobs/stats
pub async fn stats(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let stats = state.job_queue.get_stats().await?;
    Ok(Json(json!({
        "pending": stats.pending,
        "claimed": stats.claimed,
        "completed": stats.completed,
        "failed": stats.failed,
        "total": stats.total(),
    })))
}
