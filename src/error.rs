//! Error types for turnstile.

use thiserror::Error;

/// Returned when a request is denied because a bucket ran dry.
///
/// Zero-sized so the deny path never allocates or formats.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("rate limit exceeded")]
pub struct Limited;

/// Main error type for turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bucket parameters that cannot produce a working limiter
    #[error("Invalid token bucket: capacity={capacity}, rate={rate}")]
    InvalidBucket { capacity: u64, rate: f64 },

    /// The request was rate limited
    #[error(transparent)]
    Limited(#[from] Limited),

    /// The caller cancelled before the check started
    #[error("Admission check cancelled")]
    Cancelled,

    /// No pipeline is registered for the requested route
    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether this error is a rate-limit denial.
    pub fn is_limited(&self) -> bool {
        matches!(self, TurnstileError::Limited(_))
    }
}

/// Result type alias for turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
