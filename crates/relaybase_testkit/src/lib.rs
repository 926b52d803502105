//! # Relaybase Testkit
//!
//! Test utilities for Relaybase.
//!
//! This crate provides:
//! - [`TestCore`], a [`relaybase_core::SyncCore`] over in-memory stores
//! - A small blog schema and object builders
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relaybase_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn creates_a_post() {
//!     let t = TestCore::new();
//!     let outcome = t.create(APP, vec![post("p1", "c1")]).await.unwrap();
//!     assert!(outcome.result.is_complete());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
}

pub use fixtures::*;
pub use generators::*;

/// Installs a test subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
