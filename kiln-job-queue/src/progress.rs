//! What a running handler can see and report.

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::client::JobQueueClient;
use crate::types::Job;

/// Appends progress records for one job.
///
/// Reporting is best effort: a failed write is logged and swallowed so it can
/// never fail the job it describes.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    client: JobQueueClient,
    job_id: Uuid,
}

impl ProgressReporter {
    pub fn new(client: JobQueueClient, job_id: Uuid) -> Self {
        Self { client, job_id }
    }

    pub async fn report(&self, message: impl Into<String>) {
        self.write(message.into(), None).await;
    }

    pub async fn report_with(&self, message: impl Into<String>, data: Value) {
        self.write(message.into(), Some(data)).await;
    }

    async fn write(&self, message: String, data: Option<Value>) {
        if let Err(error) = self
            .client
            .record_progress(self.job_id, &message, data.as_ref())
            .await
        {
            warn!(job.id = %self.job_id, %error, "failed to record job progress");
        }
    }
}

/// Handed to [`crate::JobExecutor::execute`] for each claimed job.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    worker_id: String,
    progress: ProgressReporter,
}

impl JobContext {
    pub fn new(job: Job, worker_id: impl Into<String>, progress: ProgressReporter) -> Self {
        Self {
            job,
            worker_id: worker_id.into(),
            progress,
        }
    }

    #[inline]
    pub fn job(&self) -> &Job {
        &self.job
    }

    #[inline]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    #[inline]
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }
}
