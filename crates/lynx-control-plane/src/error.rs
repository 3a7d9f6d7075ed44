use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Raised by a task worker for a single dispatch attempt.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("attempt timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("cancelled by emergency stop")]
    Cancelled,
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::TimedOut(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Error)]
#[error("failed to write {key}: {message}")]
pub struct FlagWriteError {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Error)]
pub enum CheckError {
    #[error("{check} check timed out after {timeout_ms}ms")]
    TimedOut { check: &'static str, timeout_ms: u64 },
    #[error("{check} check failed: {message}")]
    Failed { check: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_timeouts_are_retryable() {
        assert!(DispatchError::Transient("blip".into()).is_retryable());
        assert!(DispatchError::TimedOut(Duration::from_secs(1)).is_retryable());
        assert!(!DispatchError::Permanent("bad input".into()).is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
        assert!(!DispatchError::Panicked("oops".into()).is_retryable());
    }
}
