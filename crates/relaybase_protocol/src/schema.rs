//! Per-application model definitions.

use crate::object::{is_builtin_model, is_system_field, parent_field, FIELD_USER_ID, BUILTIN_MODELS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared type of a model field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Text.
    String,
    /// Integer or floating point number.
    Number,
    /// Boolean.
    Boolean,
    /// Ordered list, duplicates allowed.
    Array,
    /// Ordered list without duplicates.
    Set,
    /// Nested JSON object.
    Object,
    /// Any JSON value.
    Any,
}

/// A declared field of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Field name.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldDefinition {
    /// Creates a field definition.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Definition of one model of an application.
///
/// A model with no declared fields is open: any non-system field may be
/// patched. Built-in models are always open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Model name as used in patches and objects.
    pub name: String,
    /// Storage namespace used in channel keys and index names.
    pub namespace: String,
    /// Parent model, if objects of this model hang off another object.
    #[serde(default)]
    pub parent: Option<String>,
    /// Declared fields.
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl ModelDefinition {
    /// Creates an open model whose namespace equals its name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            namespace: name.clone(),
            name,
            parent: None,
            fields: Vec::new(),
        }
    }

    /// Sets the storage namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the parent model.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declares a field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDefinition::new(name, field_type));
        self
    }

    /// Returns true if this is a built-in model.
    pub fn is_builtin(&self) -> bool {
        is_builtin_model(&self.name)
    }

    /// Returns the declared type of a field.
    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.field_type)
    }

    /// Returns true if `field` may legally appear on objects of this model.
    pub fn declares(&self, field: &str) -> bool {
        if self.fields.is_empty() || is_system_field(field) || field == FIELD_USER_ID {
            return true;
        }
        if let Some(parent) = &self.parent {
            if field == parent_field(parent) {
                return true;
            }
        }
        self.field_type(field).is_some()
    }

    /// Returns true if appending an already-present value must be skipped.
    pub fn forbids_duplicates(&self, field: &str) -> bool {
        self.field_type(field) == Some(FieldType::Set)
    }
}

/// All model definitions of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSchema {
    /// Owning application.
    pub application_id: String,
    /// Models by name.
    pub models: BTreeMap<String, ModelDefinition>,
}

impl ApplicationSchema {
    /// Creates a schema holding only the built-in models.
    pub fn new(application_id: impl Into<String>) -> Self {
        let models = BUILTIN_MODELS
            .iter()
            .map(|name| (name.to_string(), ModelDefinition::new(*name)))
            .collect();
        Self {
            application_id: application_id.into(),
            models,
        }
    }

    /// Adds or replaces a model definition.
    #[must_use]
    pub fn with_model(mut self, model: ModelDefinition) -> Self {
        self.models.insert(model.name.clone(), model);
        self
    }

    /// Looks up a model definition.
    pub fn model(&self, name: &str) -> Option<&ModelDefinition> {
        self.models.get(name)
    }
}

/// Resolves model names to storage namespaces.
///
/// Channel keys and index names are built from namespaces, never from raw
/// model names, so every component that renders one takes a lookup.
pub trait ModelNamespaces {
    /// Returns the namespace of `model` in `application_id`, or `None` if
    /// the application does not define it.
    fn model_namespace(&self, application_id: &str, model: &str) -> Option<String>;
}

impl ModelNamespaces for ApplicationSchema {
    fn model_namespace(&self, application_id: &str, model: &str) -> Option<String> {
        if application_id != self.application_id {
            return None;
        }
        self.model(model).map(|m| m.namespace.clone())
    }
}
