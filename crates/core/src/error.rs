//! Error types for the StoryLoom domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum.

use thiserror::Error;

/// The top-level error type for all StoryLoom operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Generation collaborator ---
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    // --- Durable store ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Scheduler ---
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// A classified failure from the generation collaborator.
///
/// The classification decides the scheduler's retry policy; see
/// [`GenerationError::is_retryable`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("Rate limited by generation service (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Generation service unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown generation failure: {0}")]
    Unknown(String),
}

impl GenerationError {
    /// Whether a retry can plausibly succeed.
    ///
    /// Rate limits, transient server failures and unclassified failures are
    /// retried; authentication and malformed requests never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable(_) | Self::Unknown(_)
        )
    }

    /// Server-suggested minimum wait before the next attempt, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }

    /// Short machine-readable label, used in logs and results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Authentication(_) => "authentication",
            Self::MalformedRequest(_) => "malformed_request",
            Self::Unavailable(_) => "unavailable",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Failures of the durable store collaborator.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored payload could not be decoded. Callers delete the record and
    /// treat the lookup as a miss.
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Failures surfaced by the batch scheduler to callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    #[error("Timed out waiting for {} operation(s): {}", pending.len(), pending.join(", "))]
    Timeout { pending: Vec<String> },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation id already in use: {0}")]
    DuplicateOperation(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_error_displays_correctly() {
        let err = Error::Generation(GenerationError::RateLimited {
            retry_after_secs: Some(7),
        });
        assert!(err.to_string().contains("Rate limited"));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn retry_classification() {
        assert!(GenerationError::RateLimited { retry_after_secs: None }.is_retryable());
        assert!(GenerationError::Unavailable("502".into()).is_retryable());
        assert!(GenerationError::Unknown("?".into()).is_retryable());
        assert!(!GenerationError::Authentication("bad key".into()).is_retryable());
        assert!(!GenerationError::MalformedRequest("no prompt".into()).is_retryable());
    }

    #[test]
    fn retry_after_only_from_rate_limit() {
        let limited = GenerationError::RateLimited {
            retry_after_secs: Some(3),
        };
        assert_eq!(limited.retry_after_secs(), Some(3));
        assert_eq!(GenerationError::Unavailable("x".into()).retry_after_secs(), None);
    }

    #[test]
    fn scheduler_timeout_lists_pending() {
        let err = SchedulerError::Timeout {
            pending: vec!["op-1".into(), "op-2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 operation"));
        assert!(msg.contains("op-1"));
    }
}
