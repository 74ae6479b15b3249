use crate::DbBackend;
use serde::{Deserialize, Serialize};
use sqlx::Executor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobProgressRow {
    pub seq: i64,
    pub job_id: String,
    pub message: String,
    pub data: Option<String>,
    pub created_at: String,
}

/// Appends a progress record and returns its sequence number.
pub async fn insert_progress<'e, E>(
    executor: E,
    job_id: &str,
    message: &str,
    data: Option<&str>,
    created_at: &str,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    let res = sqlx::query(
        "INSERT INTO job_progress (job_id, message, data, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(job_id)
    .bind(message)
    .bind(data)
    .bind(created_at)
    .execute(executor)
    .await?;
    Ok(res.last_insert_rowid())
}

/// The most recent `limit` records for a job, oldest first.
pub async fn list_progress<'e, E>(
    executor: E,
    job_id: &str,
    limit: i64,
) -> Result<Vec<JobProgressRow>, sqlx::Error>
where
    E: Executor<'e, Database = DbBackend>,
{
    sqlx::query_as::<_, JobProgressRow>(
        r#"
        SELECT seq, job_id, message, data, created_at FROM (
            SELECT seq, job_id, message, data, created_at
            FROM job_progress
            WHERE job_id = ?
            ORDER BY seq DESC
            LIMIT ?
        ) ORDER BY seq ASC
        "#,
    )
    .bind(job_id)
    .bind(limit)
    .fetch_all(executor)
    .await
}
