// Queries for the `jobs` table. Every state-changing statement carries its
// expected prior state in the WHERE clause; callers read "0 rows" as a lost race.

use crate::DbBackend;
use serde::{Deserialize, Serialize};
use sqlx::{Executor, QueryBuilder};

macro_rules! job_columns {
    () => {
        "id, job_type, payload, status, idempotency_key, group_key, batch_id, attempts, \
         claimed_at, claimed_by, result, error, created_at, updated_at"
    };
}

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_CLAIMED: &str = "claimed";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobsRow {
    pub id: String,
    pub job_type: String,
    pub payload: String,
    pub status: String,
    pub idempotency_key: Option<String>,
    pub group_key: Option<String>,
    pub batch_id: Option<String>,
    pub attempts: i64,
    pub claimed_at: Option<String>,
    pub claimed_by: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// The slice of a row the claim step needs to build its guard.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ClaimCandidateRow {
    pub id: String,
    pub status: String,
    pub claimed_at: Option<String>,
    pub claimed_by: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobsFilter {
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub group_key: Option<String>,
    pub batch_id: Option<String>,
}

pub async fn insert_job<'e, E>(executor: E, row: &JobsRow) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    sqlx::query(concat!(
        "INSERT INTO jobs (",
        job_columns!(),
        ") VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&row.id)
    .bind(&row.job_type)
    .bind(&row.payload)
    .bind(&row.status)
    .bind(&row.idempotency_key)
    .bind(&row.group_key)
    .bind(&row.batch_id)
    .bind(row.attempts)
    .bind(&row.claimed_at)
    .bind(&row.claimed_by)
    .bind(&row.result)
    .bind(&row.error)
    .bind(&row.created_at)
    .bind(&row.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn find_by_id<'e, E>(executor: E, id: &str) -> Result<Option<JobsRow>, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    sqlx::query_as::<_, JobsRow>(concat!(
        "SELECT ",
        job_columns!(),
        " FROM jobs WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn find_by_idempotency_key<'e, E>(
    executor: E,
    key: &str,
) -> Result<Option<JobsRow>, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    sqlx::query_as::<_, JobsRow>(concat!(
        "SELECT ",
        job_columns!(),
        " FROM jobs WHERE idempotency_key = ? AND status <> 'failed'"
    ))
    .bind(key)
    .fetch_optional(executor)
    .await
}

fn push_filter(qb: &mut QueryBuilder<'_, DbBackend>, filter: &JobsFilter) {
    if let Some(status) = &filter.status {
        qb.push(" AND status = ").push_bind(status.clone());
    }
    if let Some(job_type) = &filter.job_type {
        qb.push(" AND job_type = ").push_bind(job_type.clone());
    }
    if let Some(group_key) = &filter.group_key {
        qb.push(" AND group_key = ").push_bind(group_key.clone());
    }
    if let Some(batch_id) = &filter.batch_id {
        qb.push(" AND batch_id = ").push_bind(batch_id.clone());
    }
}

/// Newest first. `rowid` breaks ties between rows created in the same microsecond.
pub async fn list_jobs<'e, E>(
    executor: E,
    filter: &JobsFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<JobsRow>, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    let mut qb: QueryBuilder<'_, DbBackend> = QueryBuilder::new(concat!(
        "SELECT ",
        job_columns!(),
        " FROM jobs WHERE 1 = 1"
    ));
    push_filter(&mut qb, filter);
    qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    qb.build_query_as::<JobsRow>().fetch_all(executor).await
}

pub async fn count_jobs<'e, E>(executor: E, filter: &JobsFilter) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    let mut qb: QueryBuilder<'_, DbBackend> =
        QueryBuilder::new("SELECT COUNT(*) FROM jobs WHERE 1 = 1");
    push_filter(&mut qb, filter);
    qb.build_query_scalar::<i64>().fetch_one(executor).await
}

/// Oldest first: pending rows plus claimed rows whose claim predates `stale_before`.
pub async fn find_claim_candidates<'e, E>(
    executor: E,
    stale_before: &str,
    limit: i64,
) -> Result<Vec<ClaimCandidateRow>, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    sqlx::query_as::<_, ClaimCandidateRow>(
        r#"
        SELECT id, status, claimed_at, claimed_by
        FROM jobs
        WHERE status = 'pending'
           OR (status = 'claimed' AND claimed_at < ?)
        ORDER BY created_at ASC, rowid ASC
        LIMIT ?
        "#,
    )
    .bind(stale_before)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// Conditional claim. Returns `None` when the row no longer matches what the
/// caller observed (another worker got there first).
pub async fn claim_job<'e, E>(
    executor: E,
    id: &str,
    expected_status: &str,
    expected_claimed_at: Option<&str>,
    worker_id: &str,
    now: &str,
) -> Result<Option<JobsRow>, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    sqlx::query_as::<_, JobsRow>(concat!(
        "UPDATE jobs SET status = 'claimed', claimed_at = ?, claimed_by = ?, \
         attempts = attempts + 1, updated_at = ? \
         WHERE id = ? AND status = ? AND claimed_at IS ? RETURNING ",
        job_columns!()
    ))
    .bind(now)
    .bind(worker_id)
    .bind(now)
    .bind(id)
    .bind(expected_status)
    .bind(expected_claimed_at)
    .fetch_optional(executor)
    .await
}

/// Terminal transition guarded by the claim token (`claimed_at` of the claim
/// being finished).
pub async fn finish_job<'e, E>(
    executor: E,
    id: &str,
    claim_token: &str,
    status: &str,
    result: Option<&str>,
    error: Option<&str>,
    now: &str,
) -> Result<Option<JobsRow>, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    sqlx::query_as::<_, JobsRow>(concat!(
        "UPDATE jobs SET status = ?, result = ?, error = ?, claimed_at = NULL, \
         updated_at = ? WHERE id = ? AND status = 'claimed' AND claimed_at = ? RETURNING ",
        job_columns!()
    ))
    .bind(status)
    .bind(result)
    .bind(error)
    .bind(now)
    .bind(id)
    .bind(claim_token)
    .fetch_optional(executor)
    .await
}

/// Moves a terminal job back to pending. `attempts` is left alone.
pub async fn requeue_job<'e, E>(
    executor: E,
    id: &str,
    now: &str,
) -> Result<Option<JobsRow>, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    sqlx::query_as::<_, JobsRow>(concat!(
        "UPDATE jobs SET status = 'pending', claimed_at = NULL, claimed_by = NULL, \
         result = NULL, error = NULL, batch_id = NULL, updated_at = ? \
         WHERE id = ? AND status IN ('completed', 'failed') RETURNING ",
        job_columns!()
    ))
    .bind(now)
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn delete_job<'e, E>(executor: E, id: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    let res = sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn delete_jobs_by_status<'e, E>(executor: E, status: &str) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    let res = sqlx::query("DELETE FROM jobs WHERE status = ?")
        .bind(status)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

pub async fn count_by_status<'e, E>(executor: E) -> Result<Vec<(String, i64)>, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    sqlx::query_as::<_, (String, i64)>("SELECT status, COUNT(*) FROM jobs GROUP BY status")
        .fetch_all(executor)
        .await
}

/// Stamps `batch_id` on every completed, not yet batched job of a group.
pub async fn lock_batch<'e, E>(
    executor: E,
    group_key: &str,
    batch_id: &str,
    now: &str,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    let res = sqlx::query(
        r#"
        UPDATE jobs SET batch_id = ?, updated_at = ?
        WHERE group_key = ? AND status = 'completed' AND batch_id IS NULL
        "#,
    )
    .bind(batch_id)
    .bind(now)
    .bind(group_key)
    .execute(executor)
    .await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, DbConnectionConfig, DbPool};

    async fn pool() -> DbPool {
        let pool = create_pool(&DbConnectionConfig::new("sqlite::memory:"))
            .await
            .expect("create pool");
        kiln_migrations::sqlite_migrator()
            .run(&pool)
            .await
            .expect("migrate");
        pool
    }

    fn row(id: &str, created_at: &str) -> JobsRow {
        JobsRow {
            id: id.to_string(),
            job_type: "extract".to_string(),
            payload: "{}".to_string(),
            status: STATUS_PENDING.to_string(),
            idempotency_key: None,
            group_key: None,
            batch_id: None,
            attempts: 0,
            claimed_at: None,
            claimed_by: None,
            result: None,
            error: None,
            created_at: created_at.to_string(),
            updated_at: created_at.to_string(),
        }
    }

    #[tokio::test]
    async fn claim_guard_rejects_second_claimer() {
        let pool = pool().await;
        insert_job(&pool, &row("a", "2025-01-01T00:00:00.000000Z"))
            .await
            .unwrap();

        let now = "2025-01-01T00:00:01.000000Z";
        let first = claim_job(&pool, "a", STATUS_PENDING, None, "w1", now)
            .await
            .unwrap();
        let second = claim_job(&pool, "a", STATUS_PENDING, None, "w2", now)
            .await
            .unwrap();

        let first = first.expect("first claim wins");
        assert_eq!(first.attempts, 1);
        assert_eq!(first.claimed_by.as_deref(), Some("w1"));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn candidates_are_oldest_first_and_include_stale_claims() {
        let pool = pool().await;
        insert_job(&pool, &row("new", "2025-01-01T00:00:05.000000Z"))
            .await
            .unwrap();
        insert_job(&pool, &row("old", "2025-01-01T00:00:01.000000Z"))
            .await
            .unwrap();
        insert_job(&pool, &row("busy", "2025-01-01T00:00:00.000000Z"))
            .await
            .unwrap();
        claim_job(
            &pool,
            "busy",
            STATUS_PENDING,
            None,
            "w1",
            "2025-01-01T00:00:10.000000Z",
        )
        .await
        .unwrap()
        .unwrap();

        let fresh = find_claim_candidates(&pool, "2025-01-01T00:00:09.000000Z", 10)
            .await
            .unwrap();
        let ids: Vec<_> = fresh.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["old", "new"]);

        let stale = find_claim_candidates(&pool, "2025-01-01T00:00:11.000000Z", 10)
            .await
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["busy", "old", "new"]);
    }

    #[tokio::test]
    async fn lock_batch_only_touches_completed_unbatched_rows() {
        let pool = pool().await;
        let mut done = row("done", "2025-01-01T00:00:00.000000Z");
        done.status = STATUS_COMPLETED.to_string();
        done.group_key = Some("src-1".to_string());
        let mut failed = row("failed", "2025-01-01T00:00:01.000000Z");
        failed.status = STATUS_FAILED.to_string();
        failed.group_key = Some("src-1".to_string());
        insert_job(&pool, &done).await.unwrap();
        insert_job(&pool, &failed).await.unwrap();

        let now = "2025-01-01T00:01:00.000000Z";
        assert_eq!(lock_batch(&pool, "src-1", "b1", now).await.unwrap(), 1);
        assert_eq!(lock_batch(&pool, "src-1", "b2", now).await.unwrap(), 0);

        let filter = JobsFilter {
            batch_id: Some("b1".to_string()),
            ..Default::default()
        };
        assert_eq!(count_jobs(&pool, &filter).await.unwrap(), 1);
    }
}
