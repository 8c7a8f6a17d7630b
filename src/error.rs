//! Error types for the quota limiters.

use thiserror::Error;

/// Main error type for limiter and store operations.
#[derive(Error, Debug)]
pub enum LimitError {
    /// The store answered with a code outside the recognised set.
    #[error("limit: unknown status code")]
    UnknownCode,

    /// A driver is already registered under the requested kind.
    #[error("limit: duplicate driver")]
    DuplicateDriver,

    /// The sentinel driver was invoked for an unregistered kind.
    #[error("limit: unsupported driver")]
    UnsupportedDriver,

    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Any other store failure
    #[error("Store error: {0}")]
    Backend(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimitError>;
