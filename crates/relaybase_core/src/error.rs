//! Error types for the sync core.

use relaybase_protocol::ProtocolError;
use relaybase_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the sync core.
///
/// Batch operations report most of these per item through
/// [`crate::ItemError`]; only whole-request failures are returned as `Err`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// A request argument or object field is missing or malformed.
    #[error("invalid field value: {0}")]
    InvalidFieldValue(String),

    /// A patch is malformed or does not fit the stored value.
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// The addressed object does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The channel address cannot be rendered.
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    /// The device already holds this subscription.
    #[error("device {device} is already subscribed to {channel}")]
    AlreadySubscribed {
        /// Channel key.
        channel: String,
        /// Device id.
        device: String,
    },

    /// The device does not hold this subscription.
    #[error("device {device} is not subscribed to {channel}")]
    SubscriptionNotFound {
        /// Channel key.
        channel: String,
        /// Device id.
        device: String,
    },

    /// A filter or query is malformed.
    #[error("query error: {0}")]
    QueryError(String),

    /// Configuration or schema is missing or inconsistent.
    #[error("server configuration failure: {0}")]
    ServerConfigurationFailure(String),

    /// Optimistic or pessimistic retries ran out.
    #[error("gave up on {target} after {attempts} attempts")]
    ConcurrencyExhausted {
        /// Object or key being written.
        target: String,
        /// Attempts made.
        attempts: u32,
    },

    /// A store call failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The message transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A wire value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl CoreError {
    /// Returns true if the caller sent something wrong.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidFieldValue(_)
                | CoreError::InvalidPatch(_)
                | CoreError::ObjectNotFound(_)
                | CoreError::InvalidChannel(_)
                | CoreError::AlreadySubscribed { .. }
                | CoreError::SubscriptionNotFound { .. }
                | CoreError::QueryError(_)
        )
    }

    /// Returns true if repeating the request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::ConcurrencyExhausted { .. } | CoreError::Transport(_) => true,
            CoreError::Storage(e) => matches!(
                e,
                StorageError::Unavailable(_)
                    | StorageError::Locked(_)
                    | StorageError::VersionConflict { .. }
                    | StorageError::CasMismatch(_)
            ),
            _ => false,
        }
    }
}

impl From<ProtocolError> for CoreError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidPatch(m) => CoreError::InvalidPatch(m),
            ProtocolError::InvalidChannel(m) => CoreError::InvalidChannel(m),
            ProtocolError::QueryError(m) => CoreError::QueryError(m),
            ProtocolError::Codec(m) => CoreError::Codec(m),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(CoreError::InvalidPatch("bad".into()).is_client_error());
        assert!(!CoreError::Transport("down".into()).is_client_error());
        assert!(CoreError::Storage(StorageError::Unavailable("x".into())).is_retryable());
        assert!(!CoreError::Storage(StorageError::NotFound("x".into())).is_retryable());
        assert!(CoreError::ConcurrencyExhausted {
            target: "post/1".into(),
            attempts: 10
        }
        .is_retryable());
    }

    #[test]
    fn protocol_errors_keep_their_kind() {
        let err: CoreError = ProtocolError::invalid_channel("mask 3").into();
        assert_eq!(err, CoreError::InvalidChannel("mask 3".into()));
        let err: CoreError = ProtocolError::query("empty").into();
        assert!(matches!(err, CoreError::QueryError(_)));
    }

    #[test]
    fn error_display() {
        let err = CoreError::SubscriptionNotFound {
            channel: "blg:app:post:1".into(),
            device: "d1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("d1"));
        assert!(msg.contains("blg:app:post:1"));
    }
}
