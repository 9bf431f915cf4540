//! Error types for the route limiter.

use thiserror::Error;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors (unknown strategy, bad storage URL, bad file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit string could not be parsed
    #[error("Invalid rate limit: {0}")]
    RuleParse(String),

    /// A key function could not derive a tracking key
    #[error("Key function failed: {0}")]
    Key(String),

    /// The counting backend failed while evaluating a limit
    #[error("Storage error: {0}")]
    Storage(String),

    /// The counting backend does not implement the requested operation
    #[error("Operation not supported by storage: {0}")]
    NotSupported(&'static str),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for LimiterError {
    fn from(err: config::ConfigError) -> Self {
        LimiterError::Config(err.to_string())
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

/// Raised when a request exhausts one of its applicable limits.
///
/// Always rendered as `429 Too Many Requests`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RateLimitExceeded {
    message: String,
}

impl RateLimitExceeded {
    /// Body used when no message is supplied.
    pub const DEFAULT_MESSAGE: &'static str = "too many requests";

    /// Create a rejection carrying `message`, or the default body when `None`.
    pub fn new(message: Option<String>) -> Self {
        Self {
            message: message.unwrap_or_else(|| Self::DEFAULT_MESSAGE.to_string()),
        }
    }

    /// The human readable rejection message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status classification of the rejection.
    pub fn status(&self) -> http::StatusCode {
        http::StatusCode::TOO_MANY_REQUESTS
    }
}

/// Outcome of a failed gate evaluation.
///
/// Denials and unexpected failures travel on separate channels so callers
/// never mistake one for the other.
#[derive(Error, Debug)]
pub enum GateError {
    /// An applicable limit was exhausted
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    /// Something other than a denial went wrong while evaluating limits
    #[error("Failed to rate limit: {0}")]
    Unexpected(#[from] LimiterError),
}
