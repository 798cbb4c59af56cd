//! Error types for key pool construction
//!
//! Only construction and process-wide access can fail. Exhaustion, rejected
//! removals and unknown keys are reported through return values.

/// Errors from key pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key pool requires at least one non-empty key")]
    EmptySeed,

    #[error("key pool accessed before initialization")]
    Uninitialized,

    #[error("invalid pool settings: {0}")]
    InvalidSettings(String),

    #[error("HTTP client error: {0}")]
    Http(String),
}

/// Result alias for key pool operations.
pub type Result<T> = std::result::Result<T, Error>;
