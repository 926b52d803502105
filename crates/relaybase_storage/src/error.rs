//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The document or key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional document write saw a different version.
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Document id.
        id: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// A check-and-set saw a different CAS token.
    #[error("cas mismatch on key {0}")]
    CasMismatch(String),

    /// The key is held by another lock.
    #[error("key {0} is locked")]
    Locked(String),

    /// The presented lock token does not hold the key.
    #[error("lock token does not hold key {0}")]
    LockMismatch(String),

    /// A stored value is not a counter.
    #[error("key {0} does not hold a counter")]
    NotACounter(String),

    /// The native query could not be evaluated.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
