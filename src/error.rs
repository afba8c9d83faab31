//! Error taxonomy for the engine and its storage layer.
//!
//! Every engine exit path yields an [`EngineError`]; the API layer turns each
//! variant into a stable error code inside the response envelope.

use std::time::Duration;

/// Failures raised by a [`JourneyStore`](crate::storage::JourneyStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded back into a model type.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A unique key (e.g. an alert's episode key) is already taken.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}

/// Classified engine failure.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed or out-of-range input. Not retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation illegal for the journey's lifecycle state.
    #[error("invalid state: {0}")]
    State(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The underlying store failed. Retryable.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),

    /// The request did not finish within the per-request budget. Retryable.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Internal inconsistency, e.g. a factor with no weight entry.
    #[error("policy error: {0}")]
    Policy(String),
}

impl EngineError {
    /// Stable machine-readable code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::State(_) => "STATE_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Persistence(_) => "PERSISTENCE_ERROR",
            EngineError::Timeout(_) => "TIMEOUT",
            EngineError::Policy(_) => "POLICY_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Persistence(_) | EngineError::Timeout(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
