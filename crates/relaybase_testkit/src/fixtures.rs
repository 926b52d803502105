//! Test fixtures and core helpers.
//!
//! Provides a sync core over in-memory stores and builders for the objects
//! of a small blog application.

use relaybase_core::{CoreConfig, InMemoryTransport, RetryConfig, SchemaCache, SyncCore};
use relaybase_protocol::{
    ApplicationSchema, Delta, FieldType, ModelDefinition, Object, FIELD_CONTEXT_ID, FIELD_USER_ID,
};
use relaybase_storage::{DocumentStore, InMemoryDocumentStore, InMemoryStateStore};
use std::sync::Arc;

/// Application id used by the fixtures.
pub const APP: &str = "blog";

/// Schema of the fixture application.
///
/// - `post`: title, score, tags (set)
/// - `comment`: child of `post`, stored in the `comments` namespace
/// - `note`: open model
pub fn blog_schema() -> ApplicationSchema {
    ApplicationSchema::new(APP)
        .with_model(
            ModelDefinition::new("post")
                .with_field("title", FieldType::String)
                .with_field("score", FieldType::Number)
                .with_field("tags", FieldType::Set),
        )
        .with_model(
            ModelDefinition::new("comment")
                .with_namespace("comments")
                .with_parent("post")
                .with_field("body", FieldType::String)
                .with_field("likes", FieldType::Number),
        )
        .with_model(ModelDefinition::new("note"))
}

/// Config suited to tests: no backoff sleeps.
pub fn test_config() -> CoreConfig {
    CoreConfig::new().with_retry(RetryConfig::immediate())
}

/// A post in `context`.
pub fn post(id: &str, context: &str) -> Object {
    Object::new("post", id)
        .with(FIELD_CONTEXT_ID, context)
        .with("title", format!("post {id}"))
        .with("score", 0)
}

/// A comment on post `post_id`, written by `user`.
pub fn comment(id: &str, post_id: &str, context: &str, user: &str) -> Object {
    Object::new("comment", id)
        .with(FIELD_CONTEXT_ID, context)
        .with(FIELD_USER_ID, user)
        .with("post_id", post_id)
        .with("body", format!("comment {id}"))
        .with("likes", 0)
}

/// A sync core over in-memory stores.
pub struct TestCore {
    /// The core under test.
    pub core: SyncCore,
    /// Subscription state.
    pub state: Arc<InMemoryStateStore>,
    /// Transport, for inspecting published deltas.
    pub transport: Arc<InMemoryTransport>,
    /// Schema cache.
    pub schemas: Arc<SchemaCache>,
}

impl TestCore {
    /// Creates a core with the blog schema loaded.
    pub fn new() -> Self {
        Self::with_documents(test_config(), Arc::new(InMemoryDocumentStore::new()))
    }

    /// Creates a core over a caller-supplied document store.
    pub fn with_documents(config: CoreConfig, documents: Arc<dyn DocumentStore>) -> Self {
        let state = Arc::new(InMemoryStateStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let schemas = Arc::new(SchemaCache::new());
        schemas.put(blog_schema());
        let core = SyncCore::new(
            config,
            documents,
            state.clone(),
            transport.clone(),
            schemas.clone(),
        )
        .expect("Failed to build test core");
        Self {
            core,
            state,
            transport,
            schemas,
        }
    }

    /// Decodes every delta published so far.
    pub fn deltas(&self) -> Vec<Delta> {
        self.transport
            .published(&self.core.config().delta_topic)
            .iter()
            .map(|bytes| Delta::decode(bytes).expect("Failed to decode delta"))
            .collect()
    }
}

impl Default for TestCore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestCore {
    type Target = SyncCore;

    fn deref(&self) -> &Self::Target {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_objects_fit_the_schema() {
        let schema = blog_schema();
        for object in [post("p1", "c1"), comment("k1", "p1", "c1", "u1")] {
            let model = schema.model(object.model().unwrap()).unwrap();
            assert!(object.fields().keys().all(|f| model.declares(f)));
        }
    }

    #[test]
    fn test_core_has_schema() {
        let t = TestCore::new();
        assert!(t.schemas.model(APP, "comment").is_some());
        assert!(t.deltas().is_empty());
    }
}
