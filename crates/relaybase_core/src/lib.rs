//! # Relaybase Core
//!
//! Multi-tenant object sync for Relaybase.
//!
//! This crate provides:
//! - [`ObjectStoreAdapter`] and [`DocumentObjectStore`], tenant-scoped
//!   object persistence with optimistic concurrency
//! - [`SubscriptionRegistry`], channel subscriptions and cached channel counts
//! - [`DeltaDispatcher`], routing of committed mutations to subscribed
//!   channels
//! - [`MessageTransport`] and [`InMemoryTransport`], topic and queue messaging
//! - [`SyncCore`], which wires the above together
//!
//! ## Write path
//!
//! ```text
//! create / update / delete
//!   -> ObjectStoreAdapter      (schema checks, versioned writes)
//!   -> DeltaDispatcher         (channel enumeration, subscriber lookup)
//!   -> MessageTransport        (one CBOR delta per mutation)
//! ```
//!
//! Per-item failures never abort a batch: they are returned next to the
//! items that succeeded.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod adapter;
mod config;
mod dispatcher;
mod error;
mod registry;
mod schema;
mod sync;
mod transport;

pub use adapter::{
    BatchResult, CountOptions, DocumentObjectStore, ItemError, ObjectRef, ObjectStoreAdapter,
    SearchOptions, UpdatedObject, UpdatedObjects,
};
pub use config::{CoreConfig, RetryConfig};
pub use dispatcher::{ChannelDelivery, DeltaDispatcher, DeltaRoute, DispatchReport, Mutation};
pub use error::{CoreError, CoreResult};
pub use registry::{Device, SubscriptionRegistry};
pub use schema::{index_name, SchemaCache};
pub use sync::{SyncCore, SystemMessage, WriteOutcome};
pub use transport::{InMemoryTransport, MessageHandler, MessageTransport, DEFAULT_TOPIC_CAPACITY};
