//! Error taxonomy for the engine
//!
//! Validation and promotion errors go straight back to the caller.
//! Transient store errors are retried by the store layer before they surface.
//! Fraud signal errors never leave the detector: they degrade one signal to neutral.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Everything the engine can refuse or fail with
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input, rejected before any write
    #[error("validation failed: {0}")]
    Validation(String),

    /// Business-rule refusal (confidence, validation count or fraud gate)
    #[error("promotion refused: {0}")]
    Promotion(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Busy/locked database, retryable
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// A single fraud signal could not be computed
    #[error("fraud signal `{signal}` could not be computed: {reason}")]
    FraudDetection { signal: &'static str, reason: String },

    #[error("store error: {0}")]
    Store(#[source] rusqlite::Error),

    #[error("workflow error: {0}")]
    Workflow(String),

    #[error("embedding backend error: {0}")]
    Embedding(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn promotion(msg: impl Into<String>) -> Self {
        Self::Promotion(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether retrying the whole operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(
                    inner.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                Self::TransientStore(err.to_string())
            }
            _ => Self::Store(err),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Other(anyhow::anyhow!("store worker panicked or was cancelled: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert!(EngineError::from(err).is_transient());
    }

    #[test]
    fn test_other_sqlite_errors_are_not_transient() {
        let err = EngineError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(!err.is_transient());
        assert!(matches!(err, EngineError::Store(_)));
    }

    #[test]
    fn test_messages_are_human_readable() {
        let err = EngineError::promotion("confidence 0.89 is below 0.90");
        assert_eq!(
            err.to_string(),
            "promotion refused: confidence 0.89 is below 0.90"
        );
        let err = EngineError::not_found("heuristic", "abc");
        assert_eq!(err.to_string(), "heuristic not found: abc");
    }
}
