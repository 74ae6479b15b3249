//! Persistence seam for the queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::types::{ClaimCandidate, Job, JobFilter, JobStats, JobStatus, ProgressRecord, Transition};

/// Durable storage for jobs and their progress records.
///
/// Every state change goes through [`JobStore::update_status`], which applies
/// a [`Transition`] only if the row still matches the transition's expected
/// prior state. Implementations must make that check-and-set atomic.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. A duplicate idempotency key yields
    /// [`JobQueueError::Conflict`].
    async fn insert(&self, job: &Job) -> Result<(), JobQueueError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>, JobQueueError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobQueueError>;

    /// Newest first, honouring the filter's page.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobQueueError>;

    /// Total matching the filter, ignoring its page.
    async fn count(&self, filter: &JobFilter) -> Result<u64, JobQueueError>;

    /// Oldest first: pending jobs, plus claimed jobs whose claim is older
    /// than `stale_before`.
    async fn claim_candidates(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, JobQueueError>;

    /// Apply a guarded transition. Returns [`JobQueueError::NotFound`] when
    /// the job does not exist and [`JobQueueError::PreconditionFailed`] when
    /// it exists but no longer matches.
    async fn update_status(&self, id: Uuid, transition: Transition) -> Result<Job, JobQueueError>;

    async fn delete_by_id(&self, id: Uuid) -> Result<bool, JobQueueError>;

    async fn delete_all_by_status(&self, status: JobStatus) -> Result<u64, JobQueueError>;

    async fn aggregate_counts(&self) -> Result<JobStats, JobQueueError>;

    /// Stamp `batch_id` on completed, unbatched jobs of a group.
    async fn lock_batch(
        &self,
        group_key: &str,
        batch_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, JobQueueError>;

    async fn append_progress(
        &self,
        job_id: Uuid,
        message: &str,
        data: Option<&Value>,
        at: DateTime<Utc>,
    ) -> Result<ProgressRecord, JobQueueError>;

    /// The most recent `limit` records, oldest first.
    async fn list_progress(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ProgressRecord>, JobQueueError>;

    /// Cheap reachability check used by readiness probes.
    async fn ping(&self) -> Result<(), JobQueueError> {
        Ok(())
    }
}
