//! # Relaybase Storage
//!
//! Storage contracts and in-memory implementations for Relaybase.
//!
//! Two stores back the sync core:
//!
//! - A [`DocumentStore`]: indexed JSON documents with per-document
//!   versions, conditional writes and a native query DSL.
//! - A [`StateStore`]: a key-value store with CAS tokens, pessimistic
//!   locks, append and atomic counters. It holds subscription sets,
//!   device records and cached channel counts.
//!
//! Stores are async traits so that network-backed implementations can be
//! plugged in. The in-memory implementations are used in tests and for
//! ephemeral deployments.
//!
//! ## Native query DSL
//!
//! Document queries use a small JSON DSL understood by [`query::matches`]:
//!
//! ```json
//! {"bool": {"must": [{"term": {"type": "post"}}],
//!           "must_not": [{"exists": {"field": "hidden"}}]}}
//! ```
//!
//! ## Example
//!
//! ```rust
//! use relaybase_storage::{StateStore, InMemoryStateStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = InMemoryStateStore::new();
//! store.set("count:blg:app:post", "3".into()).await.unwrap();
//! assert_eq!(store.counter("count:blg:app:post", 2).await.unwrap(), Some(5));
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod document;
mod error;
mod memory;
pub mod query;
mod state;

pub use document::{
    Aggregation, AggregationKind, BulkItem, CountResponse, Document, DocumentStore, Refresh,
    SearchRequest, SortField,
};
pub use error::{StorageError, StorageResult};
pub use memory::{InMemoryDocumentStore, InMemoryStateStore};
pub use state::{CasToken, LockToken, StateStore, Versioned};
