//! Error types for the worker runtime
//!
//! Every error that reaches the dispatcher carries enough structure for the
//! queue engine to decide the job outcome: retry with backoff, retry at an
//! explicit time, or dead-letter.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("usage limit exceeded for {metric}: {used} used of {limit}")]
    UsageLimitExceeded {
        metric: String,
        used: i64,
        limit: i64,
    },

    #[error("posting limit exceeded ({reason}), retry in {remaining_ms}ms")]
    PostingLimitExceeded { reason: String, remaining_ms: i64 },

    #[error("provider auth failed ({platform}, status {status}): reconnect the account")]
    ProviderAuth {
        platform: String,
        status: u16,
        message: String,
    },

    #[error("provider rate limited ({platform}, status {status})")]
    ProviderRateLimited {
        platform: String,
        status: u16,
        retry_after_ms: Option<i64>,
    },

    #[error("provider transient failure: {message}")]
    ProviderTransient {
        platform: Option<String>,
        status: Option<u16>,
        message: String,
    },

    #[error("transcoder timed out after {timeout_ms}ms")]
    TranscoderTimeout { timeout_ms: u64 },

    #[error("transcoder failed (exit {exit_code:?}): {stderr_summary}")]
    TranscoderFailed {
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr_summary: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Whether the job that surfaced this error may be retried.
    ///
    /// Non-retryable errors dead-letter immediately; retryable ones requeue
    /// with backoff while attempts remain.
    pub fn retryable(&self) -> bool {
        match self {
            WorkerError::InvalidPayload(_) => false,
            WorkerError::NotFound { .. } => false,
            WorkerError::Conflict(_) => false,
            WorkerError::PreconditionFailed(_) => false,
            WorkerError::UsageLimitExceeded { .. } => false,
            WorkerError::ProviderAuth { .. } => false,
            WorkerError::PostingLimitExceeded { .. } => true,
            WorkerError::ProviderRateLimited { .. } => true,
            WorkerError::ProviderTransient { .. } => true,
            WorkerError::TranscoderTimeout { .. } => true,
            WorkerError::TranscoderFailed { .. } => true,
            WorkerError::Cancelled => true,
            WorkerError::Database(_) => true,
            WorkerError::Storage(_) => true,
            WorkerError::Http(_) => true,
            WorkerError::Io(_) => true,
            WorkerError::Json(_) => false,
            WorkerError::Config(_) => false,
            WorkerError::Internal(_) => true,
        }
    }

    /// Explicit retry delay carried by the error, when one exists.
    ///
    /// Rate-guard errors know exactly when the window reopens, so they
    /// override the exponential backoff schedule.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            WorkerError::PostingLimitExceeded { remaining_ms, .. } => {
                Some(Duration::from_millis((*remaining_ms).max(0) as u64))
            }
            WorkerError::ProviderRateLimited {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis((*ms).max(0) as u64)),
            _ => None,
        }
    }

    /// Short categorical tag used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::InvalidPayload(_) => "invalid_payload",
            WorkerError::NotFound { .. } => "not_found",
            WorkerError::Conflict(_) => "conflict",
            WorkerError::PreconditionFailed(_) => "precondition_failed",
            WorkerError::UsageLimitExceeded { .. } => "usage_limit_exceeded",
            WorkerError::PostingLimitExceeded { .. } => "posting_limit_exceeded",
            WorkerError::ProviderAuth { .. } => "provider_auth",
            WorkerError::ProviderRateLimited { .. } => "provider_rate_limited",
            WorkerError::ProviderTransient { .. } => "provider_transient",
            WorkerError::TranscoderTimeout { .. } => "transcoder_timeout",
            WorkerError::TranscoderFailed { .. } => "transcoder_failed",
            WorkerError::Cancelled => "cancelled",
            WorkerError::Database(_) => "database",
            WorkerError::Storage(_) => "storage",
            WorkerError::Http(_) => "http",
            WorkerError::Json(_) => "json",
            WorkerError::Io(_) => "io",
            WorkerError::Config(_) => "config",
            WorkerError::Internal(_) => "internal",
        }
    }

    /// Classifies an HTTP status from a publisher or provider API.
    pub fn from_provider_status(platform: &str, status: u16, message: String) -> Self {
        match status {
            401 | 403 => WorkerError::ProviderAuth {
                platform: platform.to_string(),
                status,
                message,
            },
            429 => WorkerError::ProviderRateLimited {
                platform: platform.to_string(),
                status,
                retry_after_ms: None,
            },
            s if s >= 500 => WorkerError::ProviderTransient {
                platform: Some(platform.to_string()),
                status: Some(status),
                message,
            },
            _ => WorkerError::Internal(format!(
                "{} returned unexpected status {}: {}",
                platform, status, message
            )),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!WorkerError::InvalidPayload("bad".into()).retryable());
        assert!(!WorkerError::UsageLimitExceeded {
            metric: "clips".into(),
            used: 450,
            limit: 450
        }
        .retryable());
        assert!(WorkerError::Cancelled.retryable());
        assert!(WorkerError::TranscoderTimeout { timeout_ms: 1000 }.retryable());
        assert!(!WorkerError::ProviderAuth {
            platform: "tiktok".into(),
            status: 401,
            message: "expired".into()
        }
        .retryable());
    }

    #[test]
    fn test_posting_limit_carries_retry_after() {
        let err = WorkerError::PostingLimitExceeded {
            reason: "account cooldown".into(),
            remaining_ms: 90_000,
        };
        assert!(err.retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(90_000)));
    }

    #[test]
    fn test_provider_status_classification() {
        assert!(matches!(
            WorkerError::from_provider_status("tiktok", 401, "nope".into()),
            WorkerError::ProviderAuth { .. }
        ));
        assert!(matches!(
            WorkerError::from_provider_status("youtube", 429, "slow down".into()),
            WorkerError::ProviderRateLimited { .. }
        ));
        assert!(matches!(
            WorkerError::from_provider_status("youtube", 503, "oops".into()),
            WorkerError::ProviderTransient { .. }
        ));
    }
}
