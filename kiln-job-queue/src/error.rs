//! Error types for the job queue system.

use thiserror::Error;
use uuid::Uuid;

use crate::types::JobStatus;

/// Errors that may occur while interacting with the job queue.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("invalid job request: {0}")]
    Validation(String),

    #[error("job conflicts with an existing record: {0}")]
    Conflict(String),

    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// A guarded transition lost a race; the row no longer matches.
    #[error("job {id} is no longer {expected}")]
    PreconditionFailed { id: Uuid, expected: String },

    #[error("job {id} cannot be retried while {status}")]
    NotRetryable { id: Uuid, status: JobStatus },

    #[error("no completed jobs awaiting a batch for group {0}")]
    NoEligibleJobs(String),

    #[error("no executor registered for job type {0}")]
    UnknownJobType(String),

    #[error("job execution failed: {0}")]
    ExecutionFailed(String),

    #[error("stored job {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JobQueueError {
    /// True for errors that mean "someone else moved this job first".
    #[inline]
    pub fn is_lost_race(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. } | Self::NotFound(_))
    }
}
