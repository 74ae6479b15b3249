//! Job execution errors.

use kiln_job_queue::JobQueueError;
use thiserror::Error;

/// Errors that may occur during job execution.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("extraction timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("extraction exited with {status}: {stderr_tail}")]
    NonZeroExit { status: String, stderr_tail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<JobError> for JobQueueError {
    fn from(err: JobError) -> Self {
        JobQueueError::ExecutionFailed(err.to_string())
    }
}
