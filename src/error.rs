//! Error types for the relay agent.
//!
//! Two failure domains are deliberately kept apart:
//!
//! - Failures talking to the *control server* surface as [`Error`] values
//!   and drive backoff/retry in the fetcher and uploader.
//! - Failures talking to a *target service* are data: the executor captures
//!   them into the task's outcome fields so the control server still learns
//!   what happened. They never appear as `Err` past the executor.

use thiserror::Error;

/// Unified error type for the agent.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or incomplete configuration. The only unrecoverable
    /// startup condition.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A fetched task failed validation at the queue boundary.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Transport-level failure on a control-server call.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Malformed JSON in a control-server response.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Scratch file or metrics directory I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed server URL or endpoint path.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// Control server answered 5xx; the caller backs off and retries.
    #[error("control server unavailable (status {status})")]
    ServerUnavailable {
        /// HTTP status code returned by the control server.
        status: u16,
    },

    /// Control server answered a status the protocol does not define.
    #[error("unexpected control server response {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code returned by the control server.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
}

/// Result type alias using the agent's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
