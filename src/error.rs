//! Error types for the Palisade resilience layer.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Palisade operations.
#[derive(Error, Debug)]
pub enum ResilienceError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller exceeded its quota; retry after the indicated delay
    #[error("Rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimitExceeded {
        /// Seconds until the quota admits another request
        retry_after_seconds: u64,
    },

    /// The guarded dependency is judged unhealthy and calls fail fast
    #[error("Circuit open for dependency `{dependency}`, retry in {retry_in_ms}ms")]
    CircuitOpen {
        /// Name of the guarded dependency
        dependency: String,
        /// Milliseconds until the breaker will admit a probe
        retry_in_ms: u64,
    },

    /// The atomic store could not be reached or answered with an error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Palisade operations.
pub type Result<T> = std::result::Result<T, ResilienceError>;
