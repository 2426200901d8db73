//! Error types for rarefit

use thiserror::Error;

/// rarefit error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid likelihood construction (duplicate sources, bad parameter declarations, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid arguments to a single call (unknown parameter, malformed guess, ...).
    #[error("Invocation error: {0}")]
    Invocation(String),

    /// Validation error raised by sources or event tables
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// Failure reported by an objective strategy (minimizer or root finder).
    #[error("Optimizer error: {0}")]
    Optimizer(String),

    /// The evaluation was cancelled through a [`CancelToken`](crate::CancelToken).
    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
