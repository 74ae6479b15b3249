//! Prompt fingerprints.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of the prompt text.
pub fn prompt_hash(prompt: &str) -> String {
    hex::encode(Sha256::digest(prompt.as_bytes()))
}

/// A fresh idempotency key for re-enqueueing a revised prompt.
///
/// Callers resubmitting a rejected artifact use this instead of the original
/// key so the queue creates a new job rather than returning the old one.
pub fn resubmission_key(prompt: &str, at: DateTime<Utc>) -> String {
    let hash = prompt_hash(prompt);
    format!("resubmit:{}:{}", &hash[..16], at.timestamp_millis())
}
