//! Error types for the store.

use thiserror::Error;

/// Errors from the SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization of a stored blob failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store is unusable (lock poisoned, task join failure, corrupt
    /// database). Propagates to the supervisor and halts the pipeline.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Whether the error is a uniqueness violation, which the ingestion path
    /// treats as "already persisted" rather than a failure.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(error, message)) => {
                error.code == rusqlite::ErrorCode::ConstraintViolation
                    && message
                        .as_deref()
                        .is_none_or(|m| m.contains("UNIQUE") || m.contains("unique"))
            }
            _ => false,
        }
    }

    /// Whether retrying the write can help (anything but a constraint
    /// violation or a missing row).
    #[must_use]
    pub fn is_retryable_write(&self) -> bool {
        !self.is_unique_violation() && !matches!(self, Self::NotFound(_))
    }
}

/// Result type alias using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;
