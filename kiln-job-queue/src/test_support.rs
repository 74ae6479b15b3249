//! Store wrapper for exercising races and store failures in unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::memory::MemoryJobStore;
use crate::store::JobStore;
use crate::types::{
    now, ClaimCandidate, Job, JobFilter, JobStats, JobStatus, ProgressRecord, Transition,
};

/// Delegates to a [`MemoryJobStore`], with two injectable behaviours:
/// a rival worker that claims a whole candidate batch before the caller
/// tries, and outcome writes that fail as if the database were unreachable.
#[derive(Debug, Default)]
pub(crate) struct InterceptStore {
    inner: MemoryJobStore,
    rival_pending: AtomicBool,
    failing_outcome_writes: AtomicUsize,
}

impl InterceptStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next candidate batch is claimed by `rival` before it is returned.
    pub(crate) fn rival_takes_next_batch(&self) {
        self.rival_pending.store(true, Ordering::SeqCst);
    }

    /// The next `n` complete/fail writes return a database error.
    pub(crate) fn fail_outcome_writes(&self, n: usize) {
        self.failing_outcome_writes.store(n, Ordering::SeqCst);
    }

    fn take_outcome_failure(&self) -> bool {
        self.failing_outcome_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobStore for InterceptStore {
    async fn insert(&self, job: &Job) -> Result<(), JobQueueError> {
        self.inner.insert(job).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>, JobQueueError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobQueueError> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobQueueError> {
        self.inner.list(filter).await
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, JobQueueError> {
        self.inner.count(filter).await
    }

    async fn claim_candidates(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, JobQueueError> {
        let candidates = self.inner.claim_candidates(stale_before, limit).await?;
        if self.rival_pending.swap(false, Ordering::SeqCst) {
            for candidate in &candidates {
                let rival = Transition::Claim {
                    worker_id: "rival".into(),
                    observed: candidate.clone(),
                    at: now(),
                };
                self.inner.update_status(candidate.id, rival).await?;
            }
        }
        Ok(candidates)
    }

    async fn update_status(&self, id: Uuid, transition: Transition) -> Result<Job, JobQueueError> {
        let is_outcome = matches!(
            transition,
            Transition::Complete { .. } | Transition::Fail { .. }
        );
        if is_outcome && self.take_outcome_failure() {
            return Err(JobQueueError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.update_status(id, transition).await
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool, JobQueueError> {
        self.inner.delete_by_id(id).await
    }

    async fn delete_all_by_status(&self, status: JobStatus) -> Result<u64, JobQueueError> {
        self.inner.delete_all_by_status(status).await
    }

    async fn aggregate_counts(&self) -> Result<JobStats, JobQueueError> {
        self.inner.aggregate_counts().await
    }

    async fn lock_batch(
        &self,
        group_key: &str,
        batch_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, JobQueueError> {
        self.inner.lock_batch(group_key, batch_id, at).await
    }

    async fn append_progress(
        &self,
        job_id: Uuid,
        message: &str,
        data: Option<&Value>,
        at: DateTime<Utc>,
    ) -> Result<ProgressRecord, JobQueueError> {
        self.inner.append_progress(job_id, message, data, at).await
    }

    async fn list_progress(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ProgressRecord>, JobQueueError> {
        self.inner.list_progress(job_id, limit).await
    }
}
