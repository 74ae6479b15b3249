//! Persistent job queue with atomic claiming and a polling worker loop.
//!
//! Jobs are enqueued (optionally deduplicated by an idempotency key), claimed
//! by exactly one worker at a time, and finish as `completed` or `failed`.
//! A claim that has been held for longer than the stale timeout is presumed
//! abandoned and may be taken over by another worker.
//!
//! # Architecture
//!
//! - [`JobQueueClient`] - Enqueue, claim and administer jobs
//! - [`JobStore`] - Persistence seam, with [`SqlJobStore`] and [`MemoryJobStore`]
//! - [`Worker`] - Polls for claimable jobs and runs them through executors
//! - [`JobExecutor`] - Trait for implementing job handlers
//! - [`Job`] - A persisted unit of work
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_job_queue::{
//!     async_trait, JobContext, JobExecutor, JobQueueClient, JobQueueError, JobRequest, Worker,
//!     WorkerConfig,
//! };
//! use serde_json::{json, Value};
//!
//! struct MyJobExecutor;
//!
//! #[async_trait]
//! impl JobExecutor for MyJobExecutor {
//!     fn job_type(&self) -> &str {
//!         "my.job"
//!     }
//!
//!     async fn execute(&self, ctx: &JobContext) -> Result<Value, JobQueueError> {
//!         ctx.progress().report("working").await;
//!         Ok(json!({ "seen": ctx.job().payload }))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = JobQueueClient::in_memory();
//!
//!     let request = JobRequest::new("my.job", json!({"key": "value"}))
//!         .with_idempotency_key("my-job-1");
//!     let result = client.enqueue(request).await.unwrap();
//!     println!("Enqueued job: {}", result.job_id());
//!
//!     let config = WorkerConfig::new("worker-1").with_executor(MyJobExecutor);
//!     Worker::new(client, config).run_until_idle().await.unwrap();
//! }
//! ```

mod client;
mod error;
mod executor;
mod memory;
mod progress;
mod sql_store;
mod store;
#[cfg(test)]
mod test_support;
mod types;
mod worker;

pub use client::{JobQueueClient, QueueSettings};
pub use error::JobQueueError;
pub use executor::{JobExecutor, NoOpExecutor};
pub use memory::MemoryJobStore;
pub use progress::{JobContext, ProgressReporter};
pub use sql_store::SqlJobStore;
pub use store::JobStore;
pub use types::{
    format_timestamp, now, parse_timestamp, BatchLock, ClaimCandidate, EnqueueResult, Job,
    JobFilter, JobRequest, JobStats, JobStatus, ProgressRecord, Transition,
};
pub use worker::{Worker, WorkerConfig};

// Re-export async_trait for convenience when implementing JobExecutor
pub use async_trait::async_trait;
