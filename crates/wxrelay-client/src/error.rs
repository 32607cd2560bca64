//! Error types for the remote daemon client.

use thiserror::Error;

/// Errors from talking to a remote WeChat automation daemon.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Network or transport failure (DNS, reset, TLS, timeout).
    ///
    /// Typically retryable; the listener manager marks the instance
    /// disconnected and retries on the next poll cycle.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Middleware layer error (retry policy exhaustion wraps here).
    #[error("middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// The daemon answered with an HTTP error status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated for logs.
        body: String,
    },

    /// The daemon's envelope carried a non-zero business code.
    #[error("remote error {code}: {message}")]
    Api {
        /// The `code` field of the response envelope.
        code: i64,
        /// The `message` field of the response envelope.
        message: String,
    },

    /// The response body did not match the expected envelope.
    #[error("invalid response: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    /// Bad base URL or other local configuration problem.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No client is registered for the given instance id.
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
}

impl ClientError {
    /// Whether the failure is a transport-level one that a later poll cycle
    /// may clear, as opposed to a remote business error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Middleware(_))
    }

    /// Whether the remote reported the listener as missing, which means the
    /// subscription must be re-armed.
    #[must_use]
    pub fn is_listener_missing(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 404,
            Self::Api { message, .. } => message.contains("not found") || message.contains("监听"),
            _ => false,
        }
    }
}

/// Result type alias using [`ClientError`].
pub type Result<T> = std::result::Result<T, ClientError>;
