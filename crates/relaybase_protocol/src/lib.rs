//! # Relaybase Protocol
//!
//! Value types shared by every Relaybase component.
//!
//! This crate provides:
//! - [`Object`], the application object record
//! - [`Patch`] and [`apply_patches`], the field-level mutation model
//! - [`Delta`], a committed mutation addressed to channels, with CBOR codec
//! - [`ChannelAddress`] and [`ChannelKey`], the canonical channel naming scheme
//! - [`Filter`], the neutral filter tree
//! - [`ApplicationSchema`] and [`ModelNamespaces`], model definitions
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod channel;
mod delta;
mod error;
mod filter;
mod object;
mod patch;
mod schema;

pub use channel::{
    is_legal_mask, ChannelAddress, ChannelKey, KEY_PREFIX, MASK_CONTEXT, MASK_ID, MASK_MODEL,
    MASK_PARENT, MASK_USER,
};
pub use delta::{Delta, DeltaOp};
pub use error::{ProtocolError, ProtocolResult};
pub use filter::{compare_values, like, Filter, RangeBounds};
pub use object::{
    is_builtin_model, is_system_field, now_millis, parent_field, Object, ParentRef, Timestamp,
    BUILTIN_MODELS, FIELD_APPLICATION_ID, FIELD_CONTEXT_ID, FIELD_CREATED, FIELD_ID,
    FIELD_MODIFIED, FIELD_PARENT, FIELD_TYPE, FIELD_USER_ID, MODEL_CONTEXT, MODEL_USER,
    SYSTEM_FIELDS,
};
pub use patch::{apply_patches, Patch, PatchOp, PatchPath};
pub use schema::{ApplicationSchema, FieldDefinition, FieldType, ModelDefinition, ModelNamespaces};
