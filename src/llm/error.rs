//! Error types for the inference client.

use thiserror::Error;

/// Errors produced while talking to the inference peer.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The peer did not accept the connection in time.
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),
    /// The peer accepted the connection but stopped sending.
    #[error("read timeout: {0}")]
    ReadTimeout(String),
    /// Connection refused or reset.
    #[error("connection failed: {0}")]
    Connection(String),
    /// HTTP response was not a success.
    #[error("inference http status not ok: {0}")]
    HttpStatus(u16),
    /// Other HTTP client error (including client construction).
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    /// A response body could not be decoded.
    #[error("response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    /// The peer reported an error inside the stream.
    #[error("peer error: {0}")]
    Peer(String),
    /// The response lacked the expected fields.
    #[error("inference response malformed")]
    MalformedResponse,
    /// The caller cancelled before a connection was established.
    #[error("request cancelled")]
    Cancelled,
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: Box<InferenceError>,
    },
}

impl InferenceError {
    /// Classify a `reqwest` error into connect/read/connection buckets.
    #[must_use]
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() && err.is_connect() {
            Self::ConnectTimeout(err.to_string())
        } else if err.is_timeout() {
            Self::ReadTimeout(err.to_string())
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else {
            Self::HttpClient(err)
        }
    }

    /// Classify an I/O error raised while reading a response body.
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::ReadTimeout(err.to_string())
            }
            _ => Self::Connection(err.to_string()),
        }
    }

    /// Check if this error is worth another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectTimeout(_) | Self::ReadTimeout(_) | Self::Connection(_) => true,
            Self::HttpStatus(status) => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Short label for structured logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::ReadTimeout(_) => "read_timeout",
            Self::Connection(_) => "connection",
            Self::HttpStatus(_) => "http_status",
            Self::HttpClient(_) => "http_client",
            Self::Decode(_) => "decode",
            Self::Peer(_) => "peer",
            Self::MalformedResponse => "malformed",
            Self::Cancelled => "cancelled",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

/// Convenience result alias for inference calls.
pub type InferenceResult<T> = Result<T, InferenceError>;
