//! Core types for the job queue.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobQueueError;

const MAX_JOB_TYPE_LEN: usize = 128;
const MAX_KEY_LEN: usize = 255;

/// Current time truncated to the microsecond precision the store keeps.
///
/// Claim tokens are compared for equality after a round trip through the
/// database, so every timestamp the queue produces must survive formatting.
#[inline]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339; lexical order equals chronological order.
#[inline]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        Self::Pending,
        Self::Claimed,
        Self::Completed,
        Self::Failed,
    ];

    /// Returns true if this status represents a terminal state.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(JobQueueError::Validation(format!(
                "unknown job status `{other}`"
            ))),
        }
    }
}

/// A request to enqueue a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub group_key: Option<String>,
}

impl JobRequest {
    #[inline]
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            idempotency_key: None,
            group_key: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_group_key(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }

    /// Rejects malformed requests before anything is written.
    pub fn validate(&self) -> Result<(), JobQueueError> {
        let job_type = self.job_type.trim();
        if job_type.is_empty() {
            return Err(JobQueueError::Validation("type is required".into()));
        }
        if job_type.len() > MAX_JOB_TYPE_LEN {
            return Err(JobQueueError::Validation(format!(
                "type must be at most {MAX_JOB_TYPE_LEN} characters"
            )));
        }
        if !job_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ':'))
        {
            return Err(JobQueueError::Validation(format!(
                "type `{job_type}` contains unsupported characters"
            )));
        }
        if !self.payload.is_object() {
            return Err(JobQueueError::Validation(
                "payload must be a JSON object".into(),
            ));
        }
        check_optional_key("idempotencyKey", self.idempotency_key.as_deref())?;
        check_optional_key("groupKey", self.group_key.as_deref())?;
        Ok(())
    }
}

fn check_optional_key(field: &str, value: Option<&str>) -> Result<(), JobQueueError> {
    match value {
        Some(v) if v.trim().is_empty() => Err(JobQueueError::Validation(format!(
            "{field} cannot be empty if provided"
        ))),
        Some(v) if v.len() > MAX_KEY_LEN => Err(JobQueueError::Validation(format!(
            "{field} must be at most {MAX_KEY_LEN} characters"
        ))),
        _ => Ok(()),
    }
}

/// Result returned after a job has been enqueued.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueResult {
    pub job: Job,
    /// True when an existing job with the same idempotency key was returned.
    pub deduplicated: bool,
}

impl EnqueueResult {
    #[inline]
    pub fn job_id(&self) -> Uuid {
        self.job.id
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    pub idempotency_key: Option<String>,
    pub group_key: Option<String>,
    pub batch_id: Option<String>,
    pub attempts: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job from a validated request.
    pub fn pending(request: JobRequest, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: request.job_type.trim().to_owned(),
            payload: request.payload,
            status: JobStatus::Pending,
            idempotency_key: request.idempotency_key,
            group_key: request.group_key,
            batch_id: None,
            attempts: 0,
            claimed_at: None,
            claimed_by: None,
            result: None,
            error: None,
            created_at: at,
            updated_at: at,
        }
    }

    /// The claim token: `claimed_at` of the claim currently held.
    #[inline]
    pub fn claim_token(&self) -> Option<DateTime<Utc>> {
        match self.status {
            JobStatus::Claimed => self.claimed_at,
            _ => None,
        }
    }

    /// Typed view of the payload.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, JobQueueError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            JobQueueError::ExecutionFailed(format!("invalid payload for {}: {e}", self.job_type))
        })
    }
}

/// What a claimer observed about a job before attempting the conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimCandidate {
    pub id: Uuid,
    pub status: JobStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
}

impl ClaimCandidate {
    #[inline]
    pub fn is_stale_claim(&self) -> bool {
        self.status == JobStatus::Claimed
    }
}

/// A single guarded state change applied by [`crate::JobStore::update_status`].
#[derive(Debug, Clone)]
pub enum Transition {
    /// `pending` (or stale `claimed`) → `claimed`, guarded by the observation.
    Claim {
        worker_id: String,
        observed: ClaimCandidate,
        at: DateTime<Utc>,
    },
    /// `claimed` → `completed`, guarded by the claim token.
    Complete {
        claim_token: DateTime<Utc>,
        result: Value,
        at: DateTime<Utc>,
    },
    /// `claimed` → `failed`, guarded by the claim token.
    Fail {
        claim_token: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },
    /// `completed`/`failed` → `pending`.
    Requeue { at: DateTime<Utc> },
}

impl Transition {
    /// Human-readable prior state this transition requires.
    pub fn expected(&self) -> String {
        match self {
            Self::Claim { observed, .. } => match observed.claimed_at {
                Some(at) => format!("{} since {}", observed.status, format_timestamp(&at)),
                None => observed.status.to_string(),
            },
            Self::Complete { claim_token, .. } | Self::Fail { claim_token, .. } => {
                format!("claimed at {}", format_timestamp(claim_token))
            }
            Self::Requeue { .. } => "completed or failed".to_owned(),
        }
    }
}

/// Filter and page for listing jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub group_key: Option<String>,
    pub batch_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            group_key: None,
            batch_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.as_deref().map_or(true, |t| job.job_type == t)
            && self
                .group_key
                .as_deref()
                .map_or(true, |g| job.group_key.as_deref() == Some(g))
            && self
                .batch_id
                .as_deref()
                .map_or(true, |b| job.batch_id.as_deref() == Some(b))
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    #[inline]
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.completed + self.failed
    }

    #[inline]
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Claimed => self.claimed,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub(crate) fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Claimed => self.claimed += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
        }
    }
}

/// Outcome of advancing a group of completed jobs under one batch id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLock {
    pub batch_id: String,
    pub locked_count: u64,
}

/// A best-effort progress note written while a handler runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub seq: i64,
    pub job_id: Uuid,
    pub message: String,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_strings() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn timestamps_are_fixed_width_and_survive_formatting() {
        let ts = now();
        let formatted = format_timestamp(&ts);
        assert_eq!(formatted.len(), "2025-01-01T00:00:00.000000Z".len());
        assert_eq!(parse_timestamp(&formatted).unwrap(), ts);
    }

    #[test]
    fn request_validation() {
        assert!(JobRequest::new("claude_extraction", json!({"prompt": "x"}))
            .validate()
            .is_ok());
        assert!(JobRequest::new("  ", json!({})).validate().is_err());
        assert!(JobRequest::new("bad type", json!({})).validate().is_err());
        assert!(JobRequest::new("extract", json!("text")).validate().is_err());
        assert!(JobRequest::new("extract", json!({}))
            .with_idempotency_key("")
            .validate()
            .is_err());
    }

    #[test]
    fn job_serializes_with_camel_case_and_type() {
        let job = Job::pending(JobRequest::new("extract", json!({})), now());
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["type"], "extract");
        assert_eq!(v["status"], "pending");
        assert!(v.get("claimedAt").is_some());
        assert!(v.get("idempotencyKey").is_some());
    }
}
