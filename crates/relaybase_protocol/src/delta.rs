//! Deltas: one committed object mutation plus the channels it reaches.

use crate::channel::ChannelKey;
use crate::error::{ProtocolError, ProtocolResult};
use crate::object::{Object, Timestamp};
use crate::patch::Patch;
use serde::{Deserialize, Serialize};

/// Type of mutation a delta describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOp {
    /// Object was created.
    Add,
    /// Object was patched.
    Update,
    /// Object was deleted.
    Delete,
}

impl DeltaOp {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaOp::Add => "add",
            DeltaOp::Update => "update",
            DeltaOp::Delete => "delete",
        }
    }

    /// Change this operation applies to cached channel counts.
    pub fn count_delta(&self) -> i64 {
        match self {
            DeltaOp::Add => 1,
            DeltaOp::Update => 0,
            DeltaOp::Delete => -1,
        }
    }
}

/// A single object mutation addressed to channels.
///
/// Deltas are created after a write commits, handed to the transport once
/// and never persisted. `patch` is present only for [`DeltaOp::Update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Mutation type.
    pub op: DeltaOp,
    /// Object after the mutation (before it, for deletes).
    pub object: Object,
    /// Patches applied, for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Vec<Patch>>,
    /// Channels with at least one subscriber.
    pub channels: Vec<ChannelKey>,
    /// Owning application.
    pub application_id: String,
    /// Commit time.
    pub timestamp: Timestamp,
}

impl Delta {
    /// Creates an add delta.
    pub fn add(application_id: impl Into<String>, object: Object, timestamp: Timestamp) -> Self {
        Self::build(DeltaOp::Add, application_id, object, None, timestamp)
    }

    /// Creates an update delta.
    pub fn update(
        application_id: impl Into<String>,
        object: Object,
        patch: Vec<Patch>,
        timestamp: Timestamp,
    ) -> Self {
        Self::build(DeltaOp::Update, application_id, object, Some(patch), timestamp)
    }

    /// Creates a delete delta.
    pub fn delete(application_id: impl Into<String>, object: Object, timestamp: Timestamp) -> Self {
        Self::build(DeltaOp::Delete, application_id, object, None, timestamp)
    }

    fn build(
        op: DeltaOp,
        application_id: impl Into<String>,
        object: Object,
        patch: Option<Vec<Patch>>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            op,
            object,
            patch,
            channels: Vec::new(),
            application_id: application_id.into(),
            timestamp,
        }
    }

    /// Sets the target channels.
    #[must_use]
    pub fn with_channels(mut self, channels: Vec<ChannelKey>) -> Self {
        self.channels = channels;
        self
    }

    /// Encodes to CBOR bytes for the transport.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::Codec(format!("delta encode: {e}")))?;
        Ok(buf)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let delta: Delta = ciborium::de::from_reader(bytes)
            .map_err(|e| ProtocolError::Codec(format!("delta decode: {e}")))?;
        if (delta.op == DeltaOp::Update) != delta.patch.is_some() {
            return Err(ProtocolError::Codec(
                "patch must be present exactly for update deltas".into(),
            ));
        }
        Ok(delta)
    }
}
