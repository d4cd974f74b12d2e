//! Error taxonomy for the wallet analysis engine.
//!
//! All errors are request-scoped. `FetchError` and `AnalysisError` are `Clone`
//! so a single in-flight analysis can hand the same failure to every caller
//! waiting on it.

use thiserror::Error;

use crate::records::RecordKind;

/// Input failed address-format validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address '{0}': expected 0x followed by 40 hex characters")]
pub struct InvalidAddress(pub String);

/// Why an explorer call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("rate limited by explorer: {0}")]
    RateLimited(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl FetchFailure {
    /// Timeouts, connection problems, explorer throttling and 5xx responses
    /// are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimited(_) => true,
            Self::HttpStatus(status) => *status >= 500,
            Self::Upstream(_) | Self::Decode(_) => false,
        }
    }
}

/// A failed fetch of one record kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to fetch {kind}: {failure}")]
pub struct FetchError {
    pub kind: RecordKind,
    #[source]
    pub failure: FetchFailure,
}

impl FetchError {
    pub fn new(kind: RecordKind, failure: FetchFailure) -> Self {
        Self { kind, failure }
    }
}

/// Failure of one analysis request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    InvalidAddress(#[from] InvalidAddress),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("scoring failed: {0}")]
    Scoring(String),
    /// The background analysis task panicked or was cancelled.
    #[error("analysis task failed: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_failures() {
        assert!(FetchFailure::Timeout(10).is_retryable());
        assert!(FetchFailure::Transport("reset".into()).is_retryable());
        assert!(FetchFailure::HttpStatus(503).is_retryable());
        assert!(!FetchFailure::HttpStatus(404).is_retryable());
        assert!(FetchFailure::RateLimited("Max rate limit reached".into()).is_retryable());
        assert!(!FetchFailure::Upstream("NOTOK".into()).is_retryable());
    }

    #[test]
    fn test_fetch_error_message_names_kind() {
        let err = FetchError::new(
            RecordKind::TokenTransfer,
            FetchFailure::Upstream("Max rate limit reached".into()),
        );
        let msg = err.to_string();
        assert!(msg.contains("token transfers"), "{msg}");
        assert!(msg.contains("Max rate limit reached"), "{msg}");
    }
}
