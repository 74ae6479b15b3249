//! Polling worker: claim, execute, record, repeat.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::client::JobQueueClient;
use crate::error::JobQueueError;
use crate::executor::JobExecutor;
use crate::progress::{JobContext, ProgressReporter};
use crate::types::Job;

const OUTCOME_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Identity, cadence and handlers for one worker.
#[derive(Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    executors: HashMap<String, Arc<dyn JobExecutor>>,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("worker_id", &self.worker_id)
            .field("poll_interval", &self.poll_interval)
            .field("executors", &self.job_types())
            .finish()
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: Duration::from_secs(2),
            executors: HashMap::new(),
        }
    }

    /// A worker id unique to this process: `<prefix>-<pid>-<random>`.
    pub fn generated_id(prefix: &str) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{prefix}-{}-{}", std::process::id(), &suffix[..8])
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Register a job executor for the job type it reports.
    pub fn register_executor<E: JobExecutor + 'static>(&mut self, executor: E) {
        let job_type = executor.job_type().to_owned();
        self.executors.insert(job_type, Arc::new(executor));
    }

    #[must_use]
    pub fn with_executor<E: JobExecutor + 'static>(mut self, executor: E) -> Self {
        self.register_executor(executor);
        self
    }

    pub fn executor(&self, job_type: &str) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Runs claimed jobs one at a time until told to stop.
#[derive(Debug, Clone)]
pub struct Worker {
    client: JobQueueClient,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(client: JobQueueClient, config: WorkerConfig) -> Self {
        Self { client, config }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// A job already running when shutdown is requested finishes and has its
    /// outcome recorded before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker.id = self.id(), job_types = ?self.config.job_types(), "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    trace!(
                        worker.id = self.id(),
                        "no claimable jobs, polling again in {:?}",
                        self.config.poll_interval
                    );
                    if wait_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
                Err(error) => {
                    error!(worker.id = self.id(), %error, "failed to run job");
                    if wait_or_shutdown(&mut shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
            }
        }
        info!(worker.id = self.id(), "worker stopped");
    }

    /// Drain the queue, then return how many jobs were run.
    pub async fn run_until_idle(&self) -> Result<usize, JobQueueError> {
        let mut ran = 0;
        while self.run_next_job().await?.is_some() {
            ran += 1;
        }
        debug!(worker.id = self.id(), ran, "queue drained");
        Ok(ran)
    }

    /// Run the next claimable job, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if claiming or recording the outcome failed
    pub async fn run_next_job(&self) -> Result<Option<Uuid>, JobQueueError> {
        let Some(job) = self.client.claim_next(self.id()).await? else {
            return Ok(None);
        };

        let span = info_span!(
            "job",
            job.id = %job.id,
            job.type = %job.job_type,
            worker.id = self.id(),
            attempts = job.attempts
        );

        let outcome = self.execute(&job).instrument(span.clone()).await;
        self.record_outcome(&job, outcome).instrument(span).await?;
        Ok(Some(job.id))
    }

    async fn execute(&self, job: &Job) -> Result<Value, JobQueueError> {
        let executor = self
            .config
            .executor(&job.job_type)
            .ok_or_else(|| JobQueueError::UnknownJobType(job.job_type.clone()))?;

        debug!("running job");
        let ctx = JobContext::new(
            job.clone(),
            self.id(),
            ProgressReporter::new(self.client.clone(), job.id),
        );

        AssertUnwindSafe(executor.execute(&ctx))
            .catch_unwind()
            .await
            .map_err(|panic| JobQueueError::ExecutionFailed(panic_message(&*panic)))
            .and_then(std::convert::identity)
    }

    /// Write the outcome, retrying once after a store error. If both writes
    /// fail the outcome is logged and the job stays claimed until reclaimed.
    async fn record_outcome(
        &self,
        job: &Job,
        outcome: Result<Value, JobQueueError>,
    ) -> Result<(), JobQueueError> {
        let outcome = outcome.map_err(|e| e.to_string());
        let mut recorded = self.write_outcome(job, &outcome).await;
        if let Err(e) = &recorded {
            if !e.is_lost_race() {
                warn!(error = %e, "failed to record job outcome; retrying once");
                sleep(OUTCOME_RETRY_DELAY).await;
                recorded = self.write_outcome(job, &outcome).await;
            }
        }

        match recorded {
            Err(e) if e.is_lost_race() => {
                warn!(%e, "claim lost before the outcome was recorded; discarding it");
                Ok(())
            }
            Err(e) => {
                match &outcome {
                    Ok(result) => error!(error = %e, %result, "job result could not be recorded"),
                    Err(failure) => {
                        error!(error = %e, %failure, "job failure could not be recorded")
                    }
                }
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn write_outcome(
        &self,
        job: &Job,
        outcome: &Result<Value, String>,
    ) -> Result<(), JobQueueError> {
        match outcome {
            Ok(result) => self.client.complete(job, result.clone()).await.map(drop),
            Err(error) => self.client.fail(job, error.clone()).await.map(drop),
        }
    }
}

/// Sleep for `interval`; returns true if shutdown was requested meanwhile.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = sleep(interval) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("job panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("job panicked: {msg}")
    } else {
        "job panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::NoOpExecutor;
    use crate::test_support::InterceptStore;
    use crate::types::{JobRequest, JobStatus};
    use async_trait::async_trait;
    use serde_json::json;

    struct Panicking;

    #[async_trait]
    impl JobExecutor for Panicking {
        fn job_type(&self) -> &str {
            "panics"
        }

        async fn execute(&self, _ctx: &JobContext) -> Result<Value, JobQueueError> {
            panic!("kaboom");
        }
    }

    struct Chatty;

    #[async_trait]
    impl JobExecutor for Chatty {
        fn job_type(&self) -> &str {
            "chatty"
        }

        async fn execute(&self, ctx: &JobContext) -> Result<Value, JobQueueError> {
            ctx.progress().report("step one").await;
            ctx.progress()
                .report_with("step two", json!({"pct": 50}))
                .await;
            Ok(json!({"steps": 2}))
        }
    }

    fn worker(client: &JobQueueClient) -> Worker {
        let config = WorkerConfig::new("test-worker")
            .with_poll_interval(Duration::from_millis(10))
            .with_executor(NoOpExecutor::new("noop"))
            .with_executor(Panicking)
            .with_executor(Chatty);
        Worker::new(client.clone(), config)
    }

    #[tokio::test]
    async fn unknown_type_fails_immediately() {
        let client = JobQueueClient::in_memory();
        let id = client
            .enqueue(JobRequest::new("mystery", json!({})))
            .await
            .unwrap()
            .job_id();

        assert_eq!(worker(&client).run_next_job().await.unwrap(), Some(id));
        let job = client.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("mystery"));
    }

    #[tokio::test]
    async fn panic_marks_job_failed() {
        let client = JobQueueClient::in_memory();
        let id = client
            .enqueue(JobRequest::new("panics", json!({})))
            .await
            .unwrap()
            .job_id();

        worker(&client).run_next_job().await.unwrap();
        let job = client.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn progress_and_result_are_recorded() {
        let client = JobQueueClient::in_memory();
        let id = client
            .enqueue(JobRequest::new("chatty", json!({})))
            .await
            .unwrap()
            .job_id();

        assert_eq!(worker(&client).run_until_idle().await.unwrap(), 1);
        let job = client.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"steps": 2})));

        let progress = client.list_progress(id, 10).await.unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[1].data, Some(json!({"pct": 50})));
    }

    #[tokio::test]
    async fn outcome_write_is_retried_after_store_error() {
        let store = Arc::new(InterceptStore::new());
        let client = JobQueueClient::new(store.clone());
        let id = client
            .enqueue(JobRequest::new("noop", json!({"n": 1})))
            .await
            .unwrap()
            .job_id();

        store.fail_outcome_writes(1);
        assert_eq!(worker(&client).run_next_job().await.unwrap(), Some(id));
        let job = client.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"echo": {"n": 1}})));
    }

    #[tokio::test]
    async fn outcome_write_gives_up_after_second_error() {
        let store = Arc::new(InterceptStore::new());
        let client = JobQueueClient::new(store.clone());
        let id = client
            .enqueue(JobRequest::new("noop", json!({})))
            .await
            .unwrap()
            .job_id();

        store.fail_outcome_writes(2);
        let err = worker(&client).run_next_job().await.unwrap_err();
        assert!(matches!(err, JobQueueError::Database(_)));
        let job = client.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Claimed);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let client = JobQueueClient::in_memory();
        let (tx, rx) = watch::channel(false);
        let w = worker(&client);
        let handle = tokio::spawn(async move { w.run(rx).await });

        client
            .enqueue(JobRequest::new("noop", json!({"n": 1})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker exits after shutdown")
            .unwrap();

        assert_eq!(client.get_stats().await.unwrap().completed, 1);
    }
}
