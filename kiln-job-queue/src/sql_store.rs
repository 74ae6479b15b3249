//! [`JobStore`] backed by the `jobs` and `job_progress` tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_db::job_progress::{self, JobProgressRow};
use kiln_db::jobs::{self as db_jobs, ClaimCandidateRow, JobsFilter, JobsRow};
use kiln_db::DbPool;
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobQueueError;
use crate::store::JobStore;
use crate::types::{
    format_timestamp, parse_timestamp, ClaimCandidate, Job, JobFilter, JobStats, JobStatus,
    ProgressRecord, Transition,
};

/// SQL-backed store. Claims are single conditional `UPDATE ... RETURNING`
/// statements, so concurrent workers in any number of processes sharing the
/// database never claim the same job twice.
#[derive(Debug, Clone)]
pub struct SqlJobStore {
    pool: DbPool,
}

impl SqlJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Distinguish "gone" from "moved on" after a guarded update matched nothing.
    async fn precondition_error(
        &self,
        id: Uuid,
        expected: String,
    ) -> Result<JobQueueError, JobQueueError> {
        let exists = db_jobs::find_by_id(&self.pool, &id.to_string())
            .await?
            .is_some();
        Ok(if exists {
            JobQueueError::PreconditionFailed { id, expected }
        } else {
            JobQueueError::NotFound(id)
        })
    }
}

fn corrupt(id: &str, reason: impl std::fmt::Display) -> JobQueueError {
    JobQueueError::Corrupt {
        id: id.to_owned(),
        reason: reason.to_string(),
    }
}

fn parse_ts(id: &str, field: &str, raw: &str) -> Result<DateTime<Utc>, JobQueueError> {
    parse_timestamp(raw).map_err(|e| corrupt(id, format!("{field}: {e}")))
}

fn parse_json(id: &str, field: &str, raw: &str) -> Result<Value, JobQueueError> {
    serde_json::from_str(raw).map_err(|e| corrupt(id, format!("{field}: {e}")))
}

impl TryFrom<JobsRow> for Job {
    type Error = JobQueueError;

    fn try_from(row: JobsRow) -> Result<Self, Self::Error> {
        let id = &row.id;
        Ok(Job {
            id: Uuid::parse_str(id).map_err(|e| corrupt(id, e))?,
            payload: parse_json(id, "payload", &row.payload)?,
            status: row.status.parse().map_err(|e| corrupt(id, e))?,
            attempts: u32::try_from(row.attempts).map_err(|e| corrupt(id, e))?,
            claimed_at: row
                .claimed_at
                .as_deref()
                .map(|raw| parse_ts(id, "claimed_at", raw))
                .transpose()?,
            result: row
                .result
                .as_deref()
                .map(|raw| parse_json(id, "result", raw))
                .transpose()?,
            created_at: parse_ts(id, "created_at", &row.created_at)?,
            updated_at: parse_ts(id, "updated_at", &row.updated_at)?,
            job_type: row.job_type,
            idempotency_key: row.idempotency_key,
            group_key: row.group_key,
            batch_id: row.batch_id,
            claimed_by: row.claimed_by,
            error: row.error,
        })
    }
}

impl TryFrom<&Job> for JobsRow {
    type Error = JobQueueError;

    fn try_from(job: &Job) -> Result<Self, Self::Error> {
        Ok(JobsRow {
            id: job.id.to_string(),
            job_type: job.job_type.clone(),
            payload: serde_json::to_string(&job.payload)?,
            status: job.status.as_str().to_owned(),
            idempotency_key: job.idempotency_key.clone(),
            group_key: job.group_key.clone(),
            batch_id: job.batch_id.clone(),
            attempts: i64::from(job.attempts),
            claimed_at: job.claimed_at.as_ref().map(format_timestamp),
            claimed_by: job.claimed_by.clone(),
            result: job.result.as_ref().map(serde_json::to_string).transpose()?,
            error: job.error.clone(),
            created_at: format_timestamp(&job.created_at),
            updated_at: format_timestamp(&job.updated_at),
        })
    }
}

impl TryFrom<ClaimCandidateRow> for ClaimCandidate {
    type Error = JobQueueError;

    fn try_from(row: ClaimCandidateRow) -> Result<Self, Self::Error> {
        let id = &row.id;
        Ok(ClaimCandidate {
            id: Uuid::parse_str(id).map_err(|e| corrupt(id, e))?,
            status: row.status.parse().map_err(|e| corrupt(id, e))?,
            claimed_at: row
                .claimed_at
                .as_deref()
                .map(|raw| parse_ts(id, "claimed_at", raw))
                .transpose()?,
            claimed_by: row.claimed_by,
        })
    }
}

impl TryFrom<JobProgressRow> for ProgressRecord {
    type Error = JobQueueError;

    fn try_from(row: JobProgressRow) -> Result<Self, Self::Error> {
        let id = &row.job_id;
        Ok(ProgressRecord {
            seq: row.seq,
            job_id: Uuid::parse_str(id).map_err(|e| corrupt(id, e))?,
            data: row
                .data
                .as_deref()
                .map(|raw| parse_json(id, "progress data", raw))
                .transpose()?,
            created_at: parse_ts(id, "progress created_at", &row.created_at)?,
            message: row.message,
        })
    }
}

impl From<&JobFilter> for JobsFilter {
    fn from(filter: &JobFilter) -> Self {
        JobsFilter {
            status: filter.status.map(|s| s.as_str().to_owned()),
            job_type: filter.job_type.clone(),
            group_key: filter.group_key.clone(),
            batch_id: filter.batch_id.clone(),
        }
    }
}

fn map_unique_error(err: sqlx::Error) -> JobQueueError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            JobQueueError::Conflict(db.message().to_owned())
        }
        _ => JobQueueError::Database(err),
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobStore for SqlJobStore {
    async fn insert(&self, job: &Job) -> Result<(), JobQueueError> {
        let row = JobsRow::try_from(job)?;
        db_jobs::insert_job(&self.pool, &row)
            .await
            .map_err(map_unique_error)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>, JobQueueError> {
        db_jobs::find_by_id(&self.pool, &id.to_string())
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, JobQueueError> {
        db_jobs::find_by_idempotency_key(&self.pool, key)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobQueueError> {
        let rows = db_jobs::list_jobs(
            &self.pool,
            &JobsFilter::from(filter),
            to_i64(filter.limit),
            to_i64(filter.offset),
        )
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn count(&self, filter: &JobFilter) -> Result<u64, JobQueueError> {
        let n = db_jobs::count_jobs(&self.pool, &JobsFilter::from(filter)).await?;
        Ok(n.max(0) as u64)
    }

    async fn claim_candidates(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, JobQueueError> {
        let rows = db_jobs::find_claim_candidates(
            &self.pool,
            &format_timestamp(&stale_before),
            to_i64(limit),
        )
        .await?;
        rows.into_iter().map(ClaimCandidate::try_from).collect()
    }

    async fn update_status(&self, id: Uuid, transition: Transition) -> Result<Job, JobQueueError> {
        let id_str = id.to_string();
        let expected = transition.expected();
        let updated = match transition {
            Transition::Claim {
                worker_id,
                observed,
                at,
            } => {
                let observed_at = observed.claimed_at.as_ref().map(format_timestamp);
                db_jobs::claim_job(
                    &self.pool,
                    &id_str,
                    observed.status.as_str(),
                    observed_at.as_deref(),
                    &worker_id,
                    &format_timestamp(&at),
                )
                .await?
            }
            Transition::Complete {
                claim_token,
                result,
                at,
            } => {
                let result = serde_json::to_string(&result)?;
                db_jobs::finish_job(
                    &self.pool,
                    &id_str,
                    &format_timestamp(&claim_token),
                    JobStatus::Completed.as_str(),
                    Some(&result),
                    None,
                    &format_timestamp(&at),
                )
                .await?
            }
            Transition::Fail {
                claim_token,
                error,
                at,
            } => {
                db_jobs::finish_job(
                    &self.pool,
                    &id_str,
                    &format_timestamp(&claim_token),
                    JobStatus::Failed.as_str(),
                    None,
                    Some(&error),
                    &format_timestamp(&at),
                )
                .await?
            }
            Transition::Requeue { at } => {
                // A failed job's key may have been taken by a newer job.
                db_jobs::requeue_job(&self.pool, &id_str, &format_timestamp(&at))
                    .await
                    .map_err(map_unique_error)?
            }
        };

        match updated {
            Some(row) => Job::try_from(row),
            None => Err(self.precondition_error(id, expected).await?),
        }
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool, JobQueueError> {
        Ok(db_jobs::delete_job(&self.pool, &id.to_string()).await?)
    }

    async fn delete_all_by_status(&self, status: JobStatus) -> Result<u64, JobQueueError> {
        Ok(db_jobs::delete_jobs_by_status(&self.pool, status.as_str()).await?)
    }

    async fn aggregate_counts(&self) -> Result<JobStats, JobQueueError> {
        let mut stats = JobStats::default();
        for (status, n) in db_jobs::count_by_status(&self.pool).await? {
            let status: JobStatus = status
                .parse()
                .map_err(|e| corrupt("<aggregate>", e))?;
            stats.add(status, n.max(0) as u64);
        }
        Ok(stats)
    }

    async fn lock_batch(
        &self,
        group_key: &str,
        batch_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, JobQueueError> {
        Ok(db_jobs::lock_batch(&self.pool, group_key, batch_id, &format_timestamp(&at)).await?)
    }

    async fn append_progress(
        &self,
        job_id: Uuid,
        message: &str,
        data: Option<&Value>,
        at: DateTime<Utc>,
    ) -> Result<ProgressRecord, JobQueueError> {
        let encoded = data.map(serde_json::to_string).transpose()?;
        let seq = job_progress::insert_progress(
            &self.pool,
            &job_id.to_string(),
            message,
            encoded.as_deref(),
            &format_timestamp(&at),
        )
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                JobQueueError::NotFound(job_id)
            }
            _ => JobQueueError::Database(err),
        })?;
        Ok(ProgressRecord {
            seq,
            job_id,
            message: message.to_owned(),
            data: data.cloned(),
            created_at: at,
        })
    }

    async fn list_progress(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ProgressRecord>, JobQueueError> {
        let rows =
            job_progress::list_progress(&self.pool, &job_id.to_string(), to_i64(limit)).await?;
        rows.into_iter().map(ProgressRecord::try_from).collect()
    }

    async fn ping(&self) -> Result<(), JobQueueError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
