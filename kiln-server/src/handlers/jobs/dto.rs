use kiln_job_queue::{format_timestamp, Job, JobRequest, ProgressRecord};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::validation::ValidationIssue;

/// Body of `POST /jobs`.
#[derive(Debug, Default, Deserialize)]
pub struct EnqueueJob {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub payload: Option<Value>,
    #[serde(alias = "idempotency_key", rename = "idempotencyKey")]
    pub idempotency_key: Option<String>,
    #[serde(alias = "group_key", rename = "groupKey")]
    pub group_key: Option<String>,
}

impl EnqueueJob {
    /// Field presence and shape; the queue applies its own rules on top.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        match self.job_type.as_deref().map(str::trim) {
            None => issues.push(ValidationIssue::new("type", "required", "type is required")),
            Some("") => issues.push(ValidationIssue::new(
                "type",
                "empty",
                "type must not be empty",
            )),
            Some(_) => {}
        }
        match &self.payload {
            None => issues.push(ValidationIssue::new(
                "payload",
                "required",
                "payload is required",
            )),
            Some(value) if !value.is_object() => issues.push(ValidationIssue::new(
                "payload",
                "invalid_type",
                "payload must be a JSON object",
            )),
            Some(_) => {}
        }
        if matches!(self.idempotency_key.as_deref(), Some(k) if k.trim().is_empty()) {
            issues.push(ValidationIssue::new(
                "idempotencyKey",
                "empty",
                "idempotencyKey cannot be empty if provided",
            ));
        }
        if matches!(self.group_key.as_deref(), Some(k) if k.trim().is_empty()) {
            issues.push(ValidationIssue::new(
                "groupKey",
                "empty",
                "groupKey cannot be empty if provided",
            ));
        }
        issues
    }

    pub fn into_request(self) -> JobRequest {
        let mut request = JobRequest::new(
            self.job_type.unwrap_or_default(),
            self.payload.unwrap_or(Value::Null),
        );
        request.idempotency_key = self.idempotency_key;
        request.group_key = self.group_key;
        request
    }
}

/// Body of `POST /jobs/batches/lock`.
#[derive(Debug, Default, Deserialize)]
pub struct LockBatch {
    #[serde(alias = "group_key", rename = "groupKey")]
    pub group_key: Option<String>,
    #[serde(alias = "batch_id", rename = "batchId")]
    pub batch_id: Option<String>,
}

impl LockBatch {
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.group_key.as_deref().map(str::trim).unwrap_or("").is_empty() {
            issues.push(ValidationIssue::new(
                "groupKey",
                "required",
                "groupKey is required",
            ));
        }
        if matches!(self.batch_id.as_deref(), Some(b) if b.trim().is_empty()) {
            issues.push(ValidationIssue::new(
                "batchId",
                "empty",
                "batchId cannot be empty if provided",
            ));
        }
        issues
    }
}

pub fn job_to_json(job: &Job) -> Value {
    json!({
        "id": job.id,
        "type": job.job_type,
        "payload": job.payload,
        "status": job.status.as_str(),
        "idempotencyKey": job.idempotency_key,
        "groupKey": job.group_key,
        "batchId": job.batch_id,
        "attempts": job.attempts,
        "claimedAt": job.claimed_at.as_ref().map(format_timestamp),
        "claimedBy": job.claimed_by,
        "result": job.result,
        "error": job.error,
        "createdAt": format_timestamp(&job.created_at),
        "updatedAt": format_timestamp(&job.updated_at),
    })
}

pub fn progress_to_json(record: &ProgressRecord) -> Value {
    json!({
        "seq": record.seq,
        "jobId": record.job_id,
        "message": record.message,
        "data": record.data,
        "createdAt": format_timestamp(&record.created_at),
    })
}
