//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building, parsing or applying protocol values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// A patch is structurally malformed or cannot be applied.
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// A channel address has no entry in the legal table or names an
    /// unknown model.
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    /// A filter tree is malformed.
    #[error("query error: {0}")]
    QueryError(String),

    /// Encoding or decoding of a wire value failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl ProtocolError {
    /// Creates an invalid patch error.
    pub fn invalid_patch(message: impl Into<String>) -> Self {
        Self::InvalidPatch(message.into())
    }

    /// Creates an invalid channel error.
    pub fn invalid_channel(message: impl Into<String>) -> Self {
        Self::InvalidChannel(message.into())
    }

    /// Creates a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::QueryError(message.into())
    }
}
