use axum::{http::StatusCode, response::IntoResponse, Json};
use kiln_job_queue::JobQueueError;
use serde_json::json;
use thiserror::Error;

type SerdeJsonError = serde_json::Error;

/// Top-level API error shared by all route handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    JobQueue(#[from] JobQueueError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("validation error")]
    Validation(serde_json::Value),
    #[error(transparent)]
    SerdeJson(#[from] SerdeJsonError),
}

fn job_queue_status(err: &JobQueueError) -> StatusCode {
    match err {
        JobQueueError::Validation(_) => StatusCode::BAD_REQUEST,
        JobQueueError::NotFound(_) => StatusCode::NOT_FOUND,
        JobQueueError::Conflict(_)
        | JobQueueError::PreconditionFailed { .. }
        | JobQueueError::NotRetryable { .. }
        | JobQueueError::NoEligibleJobs(_) => StatusCode::CONFLICT,
        JobQueueError::UnknownJobType(_)
        | JobQueueError::ExecutionFailed(_)
        | JobQueueError::Corrupt { .. }
        | JobQueueError::Database(_)
        | JobQueueError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::JobQueue(e) => job_queue_status(e),
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::SerdeJson(_) => StatusCode::BAD_REQUEST,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let payload = match self {
            ApiError::Validation(v) => v,
            _ => json!({ "error": self.to_string() }),
        };

        (status, Json(payload)).into_response()
    }
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}
