//! Per-application schema cache.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use relaybase_protocol::{ApplicationSchema, ModelDefinition, ModelNamespaces};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Cache of application schemas, shared by every component.
///
/// Schemas are installed with [`SchemaCache::put`] and dropped with
/// [`SchemaCache::invalidate`] when the schema registry announces a change.
/// An application with no cached schema cannot be served.
#[derive(Debug, Default)]
pub struct SchemaCache {
    schemas: RwLock<HashMap<String, Arc<ApplicationSchema>>>,
}

impl SchemaCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached schema of an application.
    pub fn get(&self, application_id: &str) -> Option<Arc<ApplicationSchema>> {
        self.schemas.read().get(application_id).cloned()
    }

    /// Installs or replaces an application schema.
    pub fn put(&self, schema: ApplicationSchema) {
        debug!(app = %schema.application_id, models = schema.models.len(), "schema cached");
        self.schemas
            .write()
            .insert(schema.application_id.clone(), Arc::new(schema));
    }

    /// Drops the cached schema of an application.
    ///
    /// Returns true if a schema was cached.
    pub fn invalidate(&self, application_id: &str) -> bool {
        let removed = self.schemas.write().remove(application_id).is_some();
        debug!(app = application_id, removed, "schema invalidated");
        removed
    }

    /// Returns the schema of an application or fails.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ServerConfigurationFailure`] if no schema is
    /// cached for `application_id`.
    pub fn require(&self, application_id: &str) -> CoreResult<Arc<ApplicationSchema>> {
        self.get(application_id).ok_or_else(|| {
            CoreError::ServerConfigurationFailure(format!(
                "no schema loaded for application {application_id}"
            ))
        })
    }

    /// Looks up one model definition.
    pub fn model(&self, application_id: &str, model: &str) -> Option<ModelDefinition> {
        self.get(application_id)
            .and_then(|schema| schema.model(model).cloned())
    }
}

impl ModelNamespaces for SchemaCache {
    fn model_namespace(&self, application_id: &str, model: &str) -> Option<String> {
        self.get(application_id)?
            .model_namespace(application_id, model)
    }
}

/// Storage index holding a namespace's documents.
pub fn index_name(application_id: &str, namespace: &str) -> String {
    format!("{application_id}.{namespace}")
}
