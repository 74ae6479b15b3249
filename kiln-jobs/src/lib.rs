//! Concrete job implementations for the kiln worker.
//!
//! This crate provides implementations of the [`JobExecutor`](kiln_job_queue::JobExecutor)
//! trait for the job types the worker knows how to run.
//!
//! # Job Types
//!
//! - `claude_extraction` - Run the code-generation agent against a target directory
//!
//! # Usage
//!
//! ```rust,no_run
//! use kiln_config::Config;
//! use kiln_job_queue::{JobQueueClient, Worker, WorkerConfig};
//! use kiln_jobs::register_all_executors;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cfg = Config::default();
//!     let mut worker_config = WorkerConfig::new("worker-1");
//!     register_all_executors(&mut worker_config, &cfg);
//!     let worker = Worker::new(JobQueueClient::in_memory(), worker_config);
//!     worker.run_until_idle().await.unwrap();
//! }
//! ```

mod error;
mod extraction;
mod prompt;

pub use error::JobError;
pub use extraction::{ExtractionExecutor, ExtractionPayload, ExtractionSettings};
pub use prompt::{prompt_hash, resubmission_key};

use kiln_config::Config;
use kiln_job_queue::WorkerConfig;

/// Register all available job executors on a worker configuration.
pub fn register_all_executors(worker: &mut WorkerConfig, cfg: &Config) {
    worker.register_executor(ExtractionExecutor::new(ExtractionSettings::from(
        &cfg.extraction,
    )));
}

/// Job type constants for type-safe job references.
pub mod job_types {
    pub const CLAUDE_EXTRACTION: &str = "claude_extraction";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_extraction() {
        let mut worker = WorkerConfig::new("w");
        register_all_executors(&mut worker, &Config::default());
        assert_eq!(worker.job_types(), vec![job_types::CLAUDE_EXTRACTION]);
    }
}
