use crate::error::ApiError;
use uuid::Uuid;

pub fn parse_positive_usize(
    raw: Option<&String>,
    fallback: usize,
    field: &str,
) -> Result<usize, ApiError> {
    match raw {
        Some(value) => {
            let parsed = value.parse::<usize>().map_err(|_| {
                ApiError::bad_request(format!("{field} must be a positive integer"))
            })?;
            if parsed == 0 {
                return Err(ApiError::bad_request(format!("{field} must be at least 1")));
            }
            Ok(parsed)
        }
        None => Ok(fallback),
    }
}

pub fn parse_non_negative_usize(raw: Option<&String>, field: &str) -> Result<usize, ApiError> {
    match raw {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ApiError::bad_request(format!("{field} must be a non-negative integer"))),
        None => Ok(0),
    }
}

/// Parse a job id path segment. Malformed ids can never match a job, so they 404.
pub fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::not_found(format!("job {raw}")))
}

/// Treat empty query values (`?status=`) as absent.
pub fn non_empty(raw: Option<&String>) -> Option<&str> {
    raw.map(|s| s.trim()).filter(|s| !s.is_empty())
}
