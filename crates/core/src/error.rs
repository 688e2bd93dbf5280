//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures raised while constructing or decoding core values.
///
/// Job lifecycle failures (unknown job, terminal-state violations, join
/// outcomes) live in the engine; this type only covers the value layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A payload blob could not be encoded or decoded.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}
