//! Error types for the Turnstile engine.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// A request that is over its quota is not an error: it is reported as a
/// [`Decision`](crate::ratelimit::Decision) with `allowed == false`.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No subject could be derived for the request
    #[error("Request identity is missing a subject")]
    MissingIdentity,

    /// No policy applies to the requested resource
    #[error("No rate limit policy configured for resource: {resource}")]
    Unresolved { resource: String },

    /// The backing state store could not be reached within its budget
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
