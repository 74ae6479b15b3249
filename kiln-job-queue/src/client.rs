//! Job queue client implementation.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::memory::MemoryJobStore;
use crate::sql_store::SqlJobStore;
use crate::store::JobStore;
use crate::types::{
    now, BatchLock, EnqueueResult, Job, JobFilter, JobRequest, JobStats, JobStatus,
    ProgressRecord, Transition,
};

/// Tunables for claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// A claim older than this is presumed abandoned and may be taken over.
    pub stale_claim_timeout: Duration,
    /// How many candidates a claim attempt looks at before giving up.
    pub claim_batch_size: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            stale_claim_timeout: Duration::from_secs(30 * 60),
            claim_batch_size: 16,
        }
    }
}

/// Interface for enqueuing, claiming and administering jobs.
#[derive(Clone)]
pub struct JobQueueClient {
    store: Arc<dyn JobStore>,
    settings: QueueSettings,
}

impl fmt::Debug for JobQueueClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueueClient")
            .field("store", &"<Arc<dyn JobStore>>")
            .field("settings", &self.settings)
            .finish()
    }
}

impl JobQueueClient {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            settings: QueueSettings::default(),
        }
    }

    /// A client over a fresh [`MemoryJobStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryJobStore::new()))
    }

    /// A client over the `jobs` tables of an already migrated database.
    pub fn sql(pool: kiln_db::DbPool) -> Self {
        Self::new(Arc::new(SqlJobStore::new(pool)))
    }

    #[must_use]
    pub fn with_settings(mut self, settings: QueueSettings) -> Self {
        self.settings = settings;
        self
    }

    #[inline]
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Enqueue a job for asynchronous processing.
    ///
    /// With an idempotency key, a second enqueue returns the existing
    /// pending, claimed or completed job untouched and reports it as
    /// deduplicated. A failed job releases its key, so the same key enqueues
    /// a fresh job.
    pub async fn enqueue(&self, request: JobRequest) -> Result<EnqueueResult, JobQueueError> {
        request.validate()?;

        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                debug!(job.id = %existing.id, idempotency_key = key, "enqueue deduplicated");
                return Ok(EnqueueResult {
                    job: existing,
                    deduplicated: true,
                });
            }
        }

        let job = Job::pending(request, now());
        match self.store.insert(&job).await {
            Ok(()) => {
                info!(job.id = %job.id, job.type = %job.job_type, "job enqueued");
                Ok(EnqueueResult {
                    job,
                    deduplicated: false,
                })
            }
            Err(JobQueueError::Conflict(reason)) => {
                // Lost a race with a concurrent enqueue of the same key.
                let Some(key) = job.idempotency_key.as_deref() else {
                    return Err(JobQueueError::Conflict(reason));
                };
                match self.store.find_by_idempotency_key(key).await? {
                    Some(existing) => {
                        debug!(job.id = %existing.id, idempotency_key = key, "enqueue deduplicated after race");
                        Ok(EnqueueResult {
                            job: existing,
                            deduplicated: true,
                        })
                    }
                    None => Err(JobQueueError::Conflict(reason)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Claim the oldest eligible job for `worker_id`.
    ///
    /// Eligible means pending, or claimed longer ago than the stale timeout.
    /// Losing a race on one candidate moves on to the next; losing a whole
    /// batch fetches the next one.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, JobQueueError> {
        let at = now();
        let stale_before = chrono::Duration::from_std(self.settings.stale_claim_timeout)
            .ok()
            .and_then(|timeout| at.checked_sub_signed(timeout))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        // Ids this call lost a race on. A batch made only of these means
        // nothing claimable is left for this caller.
        let mut lost = HashSet::new();
        loop {
            let candidates = self
                .store
                .claim_candidates(stale_before, self.settings.claim_batch_size.max(1))
                .await?;
            if candidates.iter().all(|c| lost.contains(&c.id)) {
                return Ok(None);
            }

            for candidate in candidates {
                if lost.contains(&candidate.id) {
                    continue;
                }
                let recovered = candidate.is_stale_claim().then(|| {
                    (candidate.claimed_by.clone(), candidate.claimed_at)
                });
                let transition = Transition::Claim {
                    worker_id: worker_id.to_owned(),
                    observed: candidate.clone(),
                    at,
                };
                match self.store.update_status(candidate.id, transition).await {
                    Ok(job) => {
                        if let Some((previous_worker, previous_claim)) = recovered {
                            warn!(
                                job.id = %job.id,
                                job.type = %job.job_type,
                                worker.id = worker_id,
                                previous_worker = previous_worker.as_deref().unwrap_or("<unknown>"),
                                claim_age_secs = previous_claim
                                    .map(|claimed| (at - claimed).num_seconds())
                                    .unwrap_or_default(),
                                attempts = job.attempts,
                                "recovered stale claim"
                            );
                        } else {
                            debug!(job.id = %job.id, worker.id = worker_id, "job claimed");
                        }
                        return Ok(Some(job));
                    }
                    Err(e) if e.is_lost_race() => {
                        trace!(job.id = %candidate.id, worker.id = worker_id, "lost claim race");
                        lost.insert(candidate.id);
                    }
                    Err(e) => return Err(e),
                }
            }
            trace!(worker.id = worker_id, lost = lost.len(), "whole batch lost, looking again");
        }
    }

    /// Record a successful outcome for a job this caller holds a claim on.
    pub async fn complete(&self, job: &Job, result: Value) -> Result<Job, JobQueueError> {
        let claim_token = held_claim(job)?;
        let done = self
            .store
            .update_status(
                job.id,
                Transition::Complete {
                    claim_token,
                    result,
                    at: now(),
                },
            )
            .await?;
        info!(job.id = %done.id, job.type = %done.job_type, attempts = done.attempts, "job completed");
        Ok(done)
    }

    /// Record a failure for a job this caller holds a claim on.
    pub async fn fail(&self, job: &Job, error: impl Into<String>) -> Result<Job, JobQueueError> {
        let claim_token = held_claim(job)?;
        let failed = self
            .store
            .update_status(
                job.id,
                Transition::Fail {
                    claim_token,
                    error: error.into(),
                    at: now(),
                },
            )
            .await?;
        warn!(
            job.id = %failed.id,
            job.type = %failed.job_type,
            attempts = failed.attempts,
            error = failed.error.as_deref().unwrap_or_default(),
            "job failed"
        );
        Ok(failed)
    }

    /// Move a completed or failed job back to pending.
    ///
    /// Returns `Ok(None)` when the job does not exist.
    pub async fn retry_job(&self, id: Uuid) -> Result<Option<Job>, JobQueueError> {
        match self
            .store
            .update_status(id, Transition::Requeue { at: now() })
            .await
        {
            Ok(job) => {
                info!(job.id = %job.id, job.type = %job.job_type, "job requeued");
                Ok(Some(job))
            }
            Err(JobQueueError::NotFound(_)) => Ok(None),
            Err(JobQueueError::PreconditionFailed { .. }) => {
                match self.store.find_by_id(id).await? {
                    Some(current) => Err(JobQueueError::NotRetryable {
                        id,
                        status: current.status,
                    }),
                    None => Ok(None),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a job and its progress. Returns whether a job was removed.
    pub async fn delete_job(&self, id: Uuid) -> Result<bool, JobQueueError> {
        let deleted = self.store.delete_by_id(id).await?;
        if deleted {
            info!(job.id = %id, "job deleted");
        }
        Ok(deleted)
    }

    /// Delete every completed job, batched or not.
    pub async fn purge_completed(&self) -> Result<u64, JobQueueError> {
        let purged = self.store.delete_all_by_status(JobStatus::Completed).await?;
        info!(purged, "purged completed jobs");
        Ok(purged)
    }

    pub async fn get_stats(&self) -> Result<JobStats, JobQueueError> {
        self.store.aggregate_counts().await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobQueueError> {
        self.store.list(filter).await
    }

    pub async fn count_jobs(&self, filter: &JobFilter) -> Result<u64, JobQueueError> {
        self.store.count(filter).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, JobQueueError> {
        self.store.find_by_id(id).await
    }

    /// Stamp one batch id on the completed, unbatched jobs of a group.
    ///
    /// A fresh id is generated when none is supplied.
    pub async fn lock_batch(
        &self,
        group_key: &str,
        batch_id: Option<String>,
    ) -> Result<BatchLock, JobQueueError> {
        let group_key = group_key.trim();
        if group_key.is_empty() {
            return Err(JobQueueError::Validation("groupKey is required".into()));
        }
        let batch_id = match batch_id {
            Some(id) if id.trim().is_empty() => {
                return Err(JobQueueError::Validation(
                    "batchId cannot be empty if provided".into(),
                ))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let locked_count = self.store.lock_batch(group_key, &batch_id, now()).await?;
        if locked_count == 0 {
            return Err(JobQueueError::NoEligibleJobs(group_key.to_owned()));
        }
        info!(group_key, batch_id = %batch_id, locked_count, "batch locked");
        Ok(BatchLock {
            batch_id,
            locked_count,
        })
    }

    pub async fn record_progress(
        &self,
        job_id: Uuid,
        message: &str,
        data: Option<&Value>,
    ) -> Result<ProgressRecord, JobQueueError> {
        self.store.append_progress(job_id, message, data, now()).await
    }

    pub async fn list_progress(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ProgressRecord>, JobQueueError> {
        self.store.list_progress(job_id, limit).await
    }

    /// Check that the backing store answers.
    pub async fn ping(&self) -> Result<(), JobQueueError> {
        self.store.ping().await
    }
}

fn held_claim(job: &Job) -> Result<chrono::DateTime<chrono::Utc>, JobQueueError> {
    job.claim_token()
        .ok_or_else(|| JobQueueError::PreconditionFailed {
            id: job.id,
            expected: JobStatus::Claimed.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InterceptStore;
    use serde_json::json;

    fn request(key: Option<&str>) -> JobRequest {
        let r = JobRequest::new("extract", json!({"prompt": "p"}));
        match key {
            Some(k) => r.with_idempotency_key(k),
            None => r,
        }
    }

    #[tokio::test]
    async fn enqueue_dedupes_on_key() {
        let client = JobQueueClient::in_memory();
        let first = client.enqueue(request(Some("k1"))).await.unwrap();
        let second = client.enqueue(request(Some("k1"))).await.unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.job_id(), second.job_id());
        assert_eq!(client.get_stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn failed_key_enqueues_a_fresh_job() {
        let client = JobQueueClient::in_memory();
        let first = client.enqueue(request(Some("k1"))).await.unwrap();
        let claimed = client.claim_next("w1").await.unwrap().unwrap();
        client.fail(&claimed, "boom").await.unwrap();

        let again = client.enqueue(request(Some("k1"))).await.unwrap();
        assert!(!again.deduplicated);
        assert_ne!(again.job_id(), first.job_id());
        assert_eq!(again.job.status, JobStatus::Pending);

        let repeat = client.enqueue(request(Some("k1"))).await.unwrap();
        assert!(repeat.deduplicated);
        assert_eq!(repeat.job_id(), again.job_id());

        // The failed original cannot come back while the key is held.
        let err = client.retry_job(first.job_id()).await.unwrap_err();
        assert!(matches!(err, JobQueueError::Conflict(_)));
        let stats = client.get_stats().await.unwrap();
        assert_eq!((stats.failed, stats.pending), (1, 1));
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_requests() {
        let client = JobQueueClient::in_memory();
        let err = client
            .enqueue(JobRequest::new("", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, JobQueueError::Validation(_)));
        assert_eq!(client.get_stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn claim_is_fifo() {
        let client = JobQueueClient::in_memory();
        let a = client.enqueue(request(None)).await.unwrap().job_id();
        let b = client.enqueue(request(None)).await.unwrap().job_id();

        let first = client.claim_next("w1").await.unwrap().unwrap();
        let second = client.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(first.id, a);
        assert_eq!(second.id, b);
        assert!(client.claim_next("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn losing_a_whole_batch_moves_to_the_next() {
        let store = Arc::new(InterceptStore::new());
        store.rival_takes_next_batch();
        let client = JobQueueClient::new(store).with_settings(QueueSettings {
            claim_batch_size: 4,
            ..QueueSettings::default()
        });
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(client.enqueue(request(None)).await.unwrap().job_id());
        }

        let job = client.claim_next("w1").await.unwrap().expect("fifth job is claimable");
        assert_eq!(job.id, ids[4]);
        assert_eq!(job.claimed_by.as_deref(), Some("w1"));

        let stats = client.get_stats().await.unwrap();
        assert_eq!((stats.pending, stats.claimed), (0, 5));
        assert!(client.claim_next("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_claim_is_reclaimed_and_old_outcome_discarded() {
        let client = JobQueueClient::in_memory().with_settings(QueueSettings {
            stale_claim_timeout: Duration::ZERO,
            ..QueueSettings::default()
        });
        client.enqueue(request(None)).await.unwrap();

        let first = client.claim_next("w1").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = client.claim_next("w2").await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 2);
        assert_eq!(second.claimed_by.as_deref(), Some("w2"));

        let late = client.complete(&first, json!({})).await.unwrap_err();
        assert!(matches!(late, JobQueueError::PreconditionFailed { .. }));

        let done = client.complete(&second, json!({"ok": true})).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.claimed_at.is_none());
    }

    #[tokio::test]
    async fn retry_rules() {
        let client = JobQueueClient::in_memory();
        let id = client.enqueue(request(None)).await.unwrap().job_id();

        let err = client.retry_job(id).await.unwrap_err();
        assert!(matches!(
            err,
            JobQueueError::NotRetryable {
                status: JobStatus::Pending,
                ..
            }
        ));

        let claimed = client.claim_next("w1").await.unwrap().unwrap();
        client.fail(&claimed, "boom").await.unwrap();

        let retried = client.retry_job(id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 1);
        assert!(retried.error.is_none());
        assert!(retried.claimed_by.is_none());

        assert!(client.retry_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_batch_requires_eligible_jobs() {
        let client = JobQueueClient::in_memory();
        let err = client.lock_batch("src", None).await.unwrap_err();
        assert!(matches!(err, JobQueueError::NoEligibleJobs(_)));

        client
            .enqueue(request(None).with_group_key("src"))
            .await
            .unwrap();
        let job = client.claim_next("w1").await.unwrap().unwrap();
        client.complete(&job, json!({})).await.unwrap();

        let lock = client.lock_batch("src", Some("b-1".into())).await.unwrap();
        assert_eq!(lock.locked_count, 1);
        assert_eq!(lock.batch_id, "b-1");
        assert!(client.lock_batch("src", None).await.is_err());
    }
}
