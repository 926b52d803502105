//! Domain objects.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Object identifier field.
pub const FIELD_ID: &str = "id";
/// Model name field.
pub const FIELD_TYPE: &str = "type";
/// Creation timestamp field.
pub const FIELD_CREATED: &str = "created";
/// Last modification timestamp field.
pub const FIELD_MODIFIED: &str = "modified";
/// Owning application field.
pub const FIELD_APPLICATION_ID: &str = "application_id";
/// Owning context field.
pub const FIELD_CONTEXT_ID: &str = "context_id";
/// Owning user field.
pub const FIELD_USER_ID: &str = "user_id";
/// Convenience parent reference accepted on creation.
pub const FIELD_PARENT: &str = "parent";

/// Fields that no patch may touch.
pub const SYSTEM_FIELDS: [&str; 6] = [
    FIELD_ID,
    FIELD_TYPE,
    FIELD_CREATED,
    FIELD_MODIFIED,
    FIELD_APPLICATION_ID,
    FIELD_CONTEXT_ID,
];

/// Built-in user model.
pub const MODEL_USER: &str = "user";
/// Built-in context model.
pub const MODEL_CONTEXT: &str = "context";

/// System-defined models, exempt from context scoping.
pub const BUILTIN_MODELS: [&str; 2] = [MODEL_USER, MODEL_CONTEXT];

/// Returns true if `field` is an immutable system field.
pub fn is_system_field(field: &str) -> bool {
    SYSTEM_FIELDS.contains(&field)
}

/// Returns true if `model` is one of the built-in models.
pub fn is_builtin_model(model: &str) -> bool {
    BUILTIN_MODELS.contains(&model)
}

/// Name of the linkage field an object carries for a parent of `model`.
pub fn parent_field(model: &str) -> String {
    format!("{model}_id")
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

/// Reference to a parent object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    /// Parent model name.
    pub model: String,
    /// Parent object id.
    pub id: String,
}

impl ParentRef {
    /// Creates a parent reference.
    pub fn new(model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
        }
    }
}

/// An application object: an ordered mapping of field name to JSON value.
///
/// Every stored object carries `id`, `type`, `created`, `modified`,
/// `application_id` and `context_id`; linkage to a user or a parent lives
/// in `user_id` and `<parent>_id`. Fields are only changed through
/// [`crate::apply_patches`] once the object has been created.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Object(Map<String, Value>);

impl Object {
    /// Creates an object with the given model and id.
    pub fn new(model: impl Into<String>, id: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(FIELD_ID.into(), Value::String(id.into()));
        fields.insert(FIELD_TYPE.into(), Value::String(model.into()));
        Self(fields)
    }

    /// Wraps an existing field map.
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Converts a JSON value into an object.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Codec`] if the value is not a JSON object.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(ProtocolError::Codec(format!(
                "expected object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Returns the object id.
    pub fn id(&self) -> Option<&str> {
        self.str_field(FIELD_ID)
    }

    /// Returns the model name.
    pub fn model(&self) -> Option<&str> {
        self.str_field(FIELD_TYPE)
    }

    /// Returns the creation timestamp.
    pub fn created(&self) -> Option<Timestamp> {
        self.0.get(FIELD_CREATED).and_then(Value::as_i64)
    }

    /// Returns the last modification timestamp.
    pub fn modified(&self) -> Option<Timestamp> {
        self.0.get(FIELD_MODIFIED).and_then(Value::as_i64)
    }

    /// Returns the owning application id.
    pub fn application_id(&self) -> Option<&str> {
        self.str_field(FIELD_APPLICATION_ID)
    }

    /// Returns the owning context id.
    pub fn context_id(&self) -> Option<&str> {
        self.str_field(FIELD_CONTEXT_ID)
    }

    /// Returns the owning user id.
    pub fn user_id(&self) -> Option<&str> {
        self.str_field(FIELD_USER_ID)
    }

    /// Returns the id of the parent of model `parent_model`, if linked.
    pub fn parent_id(&self, parent_model: &str) -> Option<&str> {
        self.str_field(&parent_field(parent_model))
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Removes a field, returning its value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Returns true if the field is present.
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Returns all fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Stamps `created` and `modified` for a new object.
    pub fn stamp_created(&mut self, now: Timestamp) {
        self.0.insert(FIELD_CREATED.into(), Value::from(now));
        self.0.insert(FIELD_MODIFIED.into(), Value::from(now));
    }

    /// Stamps `modified` so it is strictly greater than its previous value.
    pub(crate) fn stamp_modified(&mut self, now: Timestamp) {
        let next = match self.modified() {
            Some(previous) if previous >= now => previous + 1,
            _ => now,
        };
        self.0.insert(FIELD_MODIFIED.into(), Value::from(next));
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        object.into_value()
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accessors() {
        let object = Object::new("comment", "c-1")
            .with(FIELD_APPLICATION_ID, "app")
            .with(FIELD_CONTEXT_ID, "ctx")
            .with(FIELD_USER_ID, "u1")
            .with("post_id", "7");

        assert_eq!(object.id(), Some("c-1"));
        assert_eq!(object.model(), Some("comment"));
        assert_eq!(object.application_id(), Some("app"));
        assert_eq!(object.context_id(), Some("ctx"));
        assert_eq!(object.user_id(), Some("u1"));
        assert_eq!(object.parent_id("post"), Some("7"));
        assert_eq!(object.parent_id("album"), None);
    }

    #[test]
    fn from_value_requires_object() {
        assert!(Object::from_value(json!({"id": "1"})).is_ok());
        assert!(matches!(
            Object::from_value(json!([1, 2])),
            Err(ProtocolError::Codec(_))
        ));
    }

    #[test]
    fn stamp_modified_is_strictly_increasing() {
        let mut object = Object::new("post", "42");
        object.stamp_created(1_000);
        object.stamp_modified(1_000);
        assert_eq!(object.modified(), Some(1_001));

        object.stamp_modified(5_000);
        assert_eq!(object.modified(), Some(5_000));
        assert_eq!(object.created(), Some(1_000));
    }

    #[test]
    fn system_fields() {
        for field in SYSTEM_FIELDS {
            assert!(is_system_field(field));
        }
        assert!(!is_system_field("title"));
        assert!(!is_system_field(FIELD_USER_ID));
    }

    #[test]
    fn serializes_transparently() {
        let object = Object::new("post", "1").with("title", "hello");
        let value = serde_json::to_value(&object).unwrap();
        assert_eq!(value, json!({"id": "1", "type": "post", "title": "hello"}));
    }
}
