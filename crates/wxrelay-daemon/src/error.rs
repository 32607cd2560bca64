//! Error types for the daemon.

use thiserror::Error;

/// Errors that can occur in the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// I/O error (config file, downloads dir).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Store failure; fatal ones halt the pipeline.
    #[error("store error: {0}")]
    Store(#[from] wxrelay_store::StoreError),

    /// Remote instance client failure.
    #[error("client error: {0}")]
    Client(#[from] wxrelay_client::ClientError),

    /// Platform failure.
    #[error("platform error: {0}")]
    Platform(#[from] wxrelay_platforms::PlatformError),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

impl DaemonError {
    /// Whether this is an unrecoverable store failure that must halt the
    /// whole pipeline.
    #[must_use]
    pub const fn is_store_fatal(&self) -> bool {
        matches!(self, Self::Store(wxrelay_store::StoreError::Fatal(_)))
    }
}

impl From<anyhow::Error> for DaemonError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Result type alias using [`DaemonError`].
pub type Result<T> = std::result::Result<T, DaemonError>;
