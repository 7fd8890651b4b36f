//! Feed error types.

use std::time::Duration;

/// Errors produced while following a change feed.
///
/// Transport-level failures are absorbed by the reconnect loop; a consumer
/// only ever observes [`FeedError::ReconnectLimitExceeded`], a filter
/// failure, or a configuration problem.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Connection could not be established or broke mid-stream.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Server answered with something other than 200.
    #[error("Unexpected status {status} from feed")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// No response headers arrived in time.
    #[error("No response after {0:?}")]
    Timeout(Duration),

    /// Response was open but silent for too long.
    #[error("Feed inactive for {0:?}")]
    Inactive(Duration),

    /// Server ended the response body without a final sequence.
    #[error("Server disconnected gracefully")]
    Disconnected,

    /// Client-side filter returned an error.
    #[error("Client filter failed: {0}")]
    Filter(String),

    /// Retry budget for the current failure episode is spent.
    #[error("Reconnection limit exceeded after {attempts} attempts: {last}")]
    ReconnectLimitExceeded {
        /// Number of reconnection attempts made.
        attempts: u32,
        /// The failure that exhausted the budget.
        #[source]
        last: Box<FeedError>,
    },

    /// JSON encoding of a request body failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl FeedError {
    /// Whether the reconnect loop may absorb this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::Status { .. }
                | Self::Timeout(_)
                | Self::Inactive(_)
                | Self::Disconnected
                | Self::Http(_)
        )
    }

    /// HTTP status carried by the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::ReconnectLimitExceeded { last, .. } => last.status(),
            _ => None,
        }
    }
}

/// Result type for feed operations.
pub type FeedResult<T> = Result<T, FeedError>;
