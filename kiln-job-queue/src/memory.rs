//! In-process [`JobStore`] for tests and single-process embedding.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::store::JobStore;
use crate::types::{
    ClaimCandidate, Job, JobFilter, JobStats, JobStatus, ProgressRecord, Transition,
};

/// Internal storage optimized for both iteration and lookup by ID.
#[derive(Debug, Default)]
struct JobQueueState {
    /// Job IDs in insertion order (oldest first).
    order: Vec<Uuid>,
    jobs: HashMap<Uuid, Job>,
    /// Idempotency key -> the non-failed job holding it.
    keys: HashMap<String, Uuid>,
    progress: HashMap<Uuid, Vec<ProgressRecord>>,
    next_seq: i64,
}

impl JobQueueState {
    /// Oldest first; insertion order breaks `created_at` ties.
    fn iter_oldest(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.order.iter().filter_map(|id| self.jobs.get(id)).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Newest first; the reverse of [`Self::iter_oldest`].
    fn iter_recent(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self
            .order
            .iter()
            .rev()
            .filter_map(|id| self.jobs.get(id))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    fn remove(&mut self, id: &Uuid) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        self.order.retain(|o| o != id);
        if let Some(key) = &job.idempotency_key {
            self.release_key(key, id);
        }
        self.progress.remove(id);
        Some(job)
    }

    /// Drop `key` from the live-key index if `id` is the job holding it.
    fn release_key(&mut self, key: &str, id: &Uuid) {
        if self.keys.get(key) == Some(id) {
            self.keys.remove(key);
        }
    }
}

/// A [`JobStore`] kept entirely in memory behind a single lock.
///
/// The write lock makes every transition's check-and-set atomic, which gives
/// the same claim guarantees as the SQL store within one process.
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<JobQueueState>,
}

impl fmt::Debug for MemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryJobStore")
            .field("state", &"<RwLock<JobQueueState>>")
            .finish()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply(job: &mut Job, transition: Transition) -> bool {
    match transition {
        Transition::Claim {
            worker_id,
            observed,
            at,
        } => {
            if job.status != observed.status || job.claimed_at != observed.claimed_at {
                return false;
            }
            job.status = JobStatus::Claimed;
            job.claimed_at = Some(at);
            job.claimed_by = Some(worker_id);
            job.attempts += 1;
            job.updated_at = at;
        }
        Transition::Complete {
            claim_token,
            result,
            at,
        } => {
            if job.claim_token() != Some(claim_token) {
                return false;
            }
            job.status = JobStatus::Completed;
            job.claimed_at = None;
            job.result = Some(result);
            job.error = None;
            job.updated_at = at;
        }
        Transition::Fail {
            claim_token,
            error,
            at,
        } => {
            if job.claim_token() != Some(claim_token) {
                return false;
            }
            job.status = JobStatus::Failed;
            job.claimed_at = None;
            job.result = None;
            job.error = Some(error);
            job.updated_at = at;
        }
        Transition::Requeue { at } => {
            if !job.status.is_terminal() {
                return false;
            }
            job.status = JobStatus::Pending;
            job.claimed_at = None;
            job.claimed_by = None;
            job.result = None;
            job.error = None;
            job.batch_id = None;
            job.updated_at = at;
        }
    }
    true
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), JobQueueError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(JobQueueError::Conflict(format!("job {} already exists", job.id)));
        }
        if let Some(key) = &job.idempotency_key {
            if state.keys.contains_key(key) {
                return Err(JobQueueError::Conflict(format!(
                    "idempotency key `{key}` already in use"
                )));
            }
            state.keys.insert(key.clone(), job.id);
        }
        state.order.push(job.id);
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>, JobQueueError> {
        let state = self.state.read().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobQueueError> {
        let state = self.state.read().await;
        Ok(state.keys.get(key).and_then(|id| state.jobs.get(id)).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobQueueError> {
        let state = self.state.read().await;
        Ok(state
            .iter_recent()
            .into_iter()
            .filter(|j| filter.matches(j))
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, JobQueueError> {
        let state = self.state.read().await;
        Ok(state.jobs.values().filter(|j| filter.matches(j)).count() as u64)
    }

    async fn claim_candidates(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, JobQueueError> {
        let state = self.state.read().await;
        Ok(state
            .iter_oldest()
            .into_iter()
            .filter(|j| match j.status {
                JobStatus::Pending => true,
                JobStatus::Claimed => j.claimed_at.is_some_and(|at| at < stale_before),
                _ => false,
            })
            .take(limit)
            .map(|j| ClaimCandidate {
                id: j.id,
                status: j.status,
                claimed_at: j.claimed_at,
                claimed_by: j.claimed_by.clone(),
            })
            .collect())
    }

    async fn update_status(&self, id: Uuid, transition: Transition) -> Result<Job, JobQueueError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let job = state.jobs.get_mut(&id).ok_or(JobQueueError::NotFound(id))?;
        let expected = transition.expected();
        let was_failed = job.status == JobStatus::Failed;

        if let (Transition::Requeue { .. }, true, Some(key)) =
            (&transition, was_failed, job.idempotency_key.as_deref())
        {
            if state.keys.get(key).is_some_and(|holder| *holder != id) {
                return Err(JobQueueError::Conflict(format!(
                    "idempotency key `{key}` already in use"
                )));
            }
        }

        if !apply(job, transition) {
            return Err(JobQueueError::PreconditionFailed { id, expected });
        }
        let job = job.clone();
        if let Some(key) = job.idempotency_key.as_deref() {
            match (was_failed, job.status) {
                (false, JobStatus::Failed) => state.release_key(key, &id),
                (true, JobStatus::Pending) => {
                    state.keys.insert(key.to_owned(), id);
                }
                _ => {}
            }
        }
        Ok(job)
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool, JobQueueError> {
        let mut state = self.state.write().await;
        Ok(state.remove(&id).is_some())
    }

    async fn delete_all_by_status(&self, status: JobStatus) -> Result<u64, JobQueueError> {
        let mut state = self.state.write().await;
        let doomed: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.status == status)
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            state.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn aggregate_counts(&self) -> Result<JobStats, JobQueueError> {
        let state = self.state.read().await;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }

    async fn lock_batch(
        &self,
        group_key: &str,
        batch_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, JobQueueError> {
        let mut state = self.state.write().await;
        let mut locked = 0;
        for job in state.jobs.values_mut() {
            if job.group_key.as_deref() == Some(group_key)
                && job.status == JobStatus::Completed
                && job.batch_id.is_none()
            {
                job.batch_id = Some(batch_id.to_owned());
                job.updated_at = at;
                locked += 1;
            }
        }
        Ok(locked)
    }

    async fn append_progress(
        &self,
        job_id: Uuid,
        message: &str,
        data: Option<&Value>,
        at: DateTime<Utc>,
    ) -> Result<ProgressRecord, JobQueueError> {
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(&job_id) {
            return Err(JobQueueError::NotFound(job_id));
        }
        state.next_seq += 1;
        let record = ProgressRecord {
            seq: state.next_seq,
            job_id,
            message: message.to_owned(),
            data: data.cloned(),
            created_at: at,
        };
        state.progress.entry(job_id).or_default().push(record.clone());
        Ok(record)
    }

    async fn list_progress(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ProgressRecord>, JobQueueError> {
        let state = self.state.read().await;
        let records = state.progress.get(&job_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = records.len().saturating_sub(limit);
        Ok(records[start..].to_vec())
    }
}
