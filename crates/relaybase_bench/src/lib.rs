//! Benchmark utilities.

#![warn(missing_docs)]

use rand::Rng;
use relaybase_core::{CoreConfig, InMemoryTransport, RetryConfig, SchemaCache, SyncCore};
use relaybase_protocol::{ApplicationSchema, ModelDefinition, Object, Patch};
use relaybase_storage::{InMemoryDocumentStore, InMemoryStateStore};
use std::sync::Arc;

/// Application id used by the benchmarks.
pub const APP: &str = "bench";

/// Schema with an open `item` model and a `comment` child of it.
pub fn bench_schema() -> ApplicationSchema {
    ApplicationSchema::new(APP)
        .with_model(ModelDefinition::new("item"))
        .with_model(ModelDefinition::new("comment").with_parent("item"))
}

/// Builds a sync core over fresh in-memory stores.
pub fn bench_core() -> SyncCore {
    let schemas = Arc::new(SchemaCache::new());
    schemas.put(bench_schema());
    SyncCore::new(
        CoreConfig::new().with_retry(RetryConfig::immediate()),
        Arc::new(InMemoryDocumentStore::new()),
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryTransport::new()),
        schemas,
    )
    .expect("Failed to build sync core")
}

/// Generate `count` items in context `c1` with random scores.
pub fn generate_items(count: usize) -> Vec<Object> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            Object::new("item", format!("i{i}"))
                .with("context_id", "c1")
                .with("score", rng.gen_range(0..1000))
                .with("tags", serde_json::json!([]))
        })
        .collect()
}

/// Generate `count` patches against one object, cycling through operations.
///
/// Every `remove` undoes the preceding `append`.
pub fn generate_patches(model: &str, id: &str, count: usize) -> Vec<Patch> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let path = |field: &str| format!("{model}/{id}/{field}");
            match i % 4 {
                0 => Patch::increment(path("score"), rng.gen_range(-5..5)),
                1 => Patch::replace(path("title"), format!("title {i}")),
                2 => Patch::append(path("tags"), format!("t{}", i % 7)),
                _ => Patch::remove(path("tags"), format!("t{}", (i - 1) % 7)),
            }
        })
        .collect()
}
