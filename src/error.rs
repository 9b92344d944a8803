//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// A denied admission is not an error: it is returned as a
/// [`Verdict`](crate::ratelimit::Verdict) with `allowed == false`.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The admission key is empty or otherwise malformed
    #[error("Invalid admission key: {0}")]
    InvalidKey(String),

    /// A limit or window cannot be used to make decisions
    #[error("Invalid limit configuration: {0}")]
    InvalidConfig(String),

    /// No policy is registered for the action and there is no default
    #[error("No admission policy for action '{0}'")]
    UnknownAction(String),

    /// The key's shard lock was held by another caller
    #[error("Admission key '{0}' is contended, try again")]
    Contended(String),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Whether the error is a transient infrastructure fault rather than a
    /// caller bug.
    pub fn is_transient(&self) -> bool {
        matches!(self, TurnstileError::Contended(_))
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
