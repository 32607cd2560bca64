//! Error types for the platform workers.

use thiserror::Error;

/// Errors from invoking a service platform.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlatformError {
    /// Network or transport failure towards the upstream service.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The upstream answered with an error status.
    #[error("API error {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body excerpt.
        body: String,
    },

    /// A previously stored conversation id is no longer valid upstream and
    /// recovery without it also failed.
    #[error("stale conversation {conversation_id}")]
    SessionInvalid {
        /// The id the upstream rejected.
        conversation_id: String,
    },

    /// The upstream reported the request as failed at the business level
    /// (e.g. a Coze chat ending in `failed`).
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// The upstream answer could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Polling or the whole call exceeded its deadline.
    #[error("timed out after {0} attempts")]
    PollTimeout(u32),

    /// The platform configuration is malformed; the platform refuses to
    /// build and the rest of the registry keeps running.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local file handling failure (attachment reads).
    #[error("file error: {0}")]
    File(#[from] std::io::Error),
}

impl PlatformError {
    /// Whether the caller should invalidate the stored conversation mapping.
    #[must_use]
    pub const fn is_session_invalid(&self) -> bool {
        matches!(self, Self::SessionInvalid { .. })
    }
}

/// Result type alias using [`PlatformError`].
pub type Result<T> = std::result::Result<T, PlatformError>;
