#![allow(clippy::all)]

//! Row types and SQL for the job store tables.

pub type DbBackend = sqlx::Sqlite;

pub mod job_progress;
pub mod jobs;

pub use kiln_db_connection::{create_pool, DbConnectionConfig, DbConnectionError, DbPool};
