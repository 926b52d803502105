//! Field-level patches and the fold that applies them.
//!
//! A patch addresses exactly one field of exactly one object through a
//! `<model>/<id>/<field>` path. Applying a list of patches is a pure
//! left-to-right fold over a copy of the object; `modified` is stamped once
//! at the end of the fold.

use crate::error::{ProtocolError, ProtocolResult};
use crate::object::{is_system_field, json_kind, Object, Timestamp};
use crate::schema::ModelDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;
use tracing::debug;

/// Kind of field mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Unconditional assignment.
    Replace,
    /// Numeric addition.
    Increment,
    /// Push onto an array or concatenate onto a string.
    Append,
    /// Remove the first matching array element.
    Remove,
}

impl PatchOp {
    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOp::Replace => "replace",
            PatchOp::Increment => "increment",
            PatchOp::Append => "append",
            PatchOp::Remove => "remove",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "replace" => Some(PatchOp::Replace),
            "increment" => Some(PatchOp::Increment),
            "append" => Some(PatchOp::Append),
            "remove" => Some(PatchOp::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parsed target of a patch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchPath {
    /// Model name.
    pub model: String,
    /// Object id.
    pub id: String,
    /// Field name.
    pub field: String,
}

impl PatchPath {
    /// Parses `<model>/<id>/<field>`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPatch`] unless the path splits into
    /// exactly three non-empty segments.
    pub fn parse(path: &str) -> ProtocolResult<Self> {
        let segments: Vec<&str> = path.split('/').collect();
        match segments.as_slice() {
            [model, id, field] if !model.is_empty() && !id.is_empty() && !field.is_empty() => {
                Ok(Self {
                    model: (*model).to_string(),
                    id: (*id).to_string(),
                    field: (*field).to_string(),
                })
            }
            _ => Err(ProtocolError::invalid_patch(format!(
                "path {path:?} must be <model>/<id>/<field>"
            ))),
        }
    }
}

impl fmt::Display for PatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.model, self.id, self.field)
    }
}

/// A single field mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Operation.
    pub op: PatchOp,
    /// Target path, `<model>/<id>/<field>`.
    pub path: String,
    /// Operand.
    #[serde(default)]
    pub value: Value,
}

impl Patch {
    /// Creates a patch.
    pub fn new(op: PatchOp, path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op,
            path: path.into(),
            value: value.into(),
        }
    }

    /// Creates a `replace` patch.
    pub fn replace(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(PatchOp::Replace, path, value)
    }

    /// Creates an `increment` patch.
    pub fn increment(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(PatchOp::Increment, path, value)
    }

    /// Creates an `append` patch.
    pub fn append(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(PatchOp::Append, path, value)
    }

    /// Creates a `remove` patch.
    pub fn remove(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(PatchOp::Remove, path, value)
    }

    /// Decodes a client-submitted JSON patch.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPatch`] if the value is not an
    /// object, or `op`/`path` are missing or malformed.
    pub fn from_json(value: &Value) -> ProtocolResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| ProtocolError::invalid_patch("patch must be an object"))?;

        let op_name = map
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_patch("missing op"))?;
        let op = PatchOp::parse(op_name)
            .ok_or_else(|| ProtocolError::invalid_patch(format!("unknown op {op_name:?}")))?;

        let path = map
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_patch("missing path"))?;

        Ok(Self {
            op,
            path: path.to_string(),
            value: map.get("value").cloned().unwrap_or(Value::Null),
        })
    }

    /// Parses the target path.
    pub fn target(&self) -> ProtocolResult<PatchPath> {
        PatchPath::parse(&self.path)
    }
}

/// Applies `patches` to a copy of `object` and returns the result.
///
/// Patches are folded left to right. Patches addressing a system field are
/// dropped without error. `modified` is stamped once, after the last patch,
/// to a value strictly greater than the previous one.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidPatch`] if a path is malformed, targets a
/// different object, or an operation does not fit the field's current value
/// (for example `increment` on a string).
pub fn apply_patches(
    object: &Object,
    patches: &[Patch],
    model: Option<&ModelDefinition>,
    now: Timestamp,
) -> ProtocolResult<Object> {
    let mut next = object.clone();

    for patch in patches {
        let target = patch.target()?;
        if object.id() != Some(target.id.as_str()) {
            return Err(ProtocolError::invalid_patch(format!(
                "patch {} does not address object {:?}",
                patch.path,
                object.id()
            )));
        }
        if is_system_field(&target.field) {
            debug!(path = %patch.path, op = %patch.op, "dropping patch on system field");
            continue;
        }
        let forbid_duplicates = model.is_some_and(|m| m.forbids_duplicates(&target.field));
        apply_one(&mut next, &target.field, patch, forbid_duplicates)?;
    }

    next.stamp_modified(now);
    Ok(next)
}

fn apply_one(
    object: &mut Object,
    field: &str,
    patch: &Patch,
    forbid_duplicates: bool,
) -> ProtocolResult<()> {
    let current = object.get(field).cloned();
    let updated = match patch.op {
        PatchOp::Replace => Some(patch.value.clone()),
        PatchOp::Increment => Some(increment(current.as_ref(), &patch.value, &patch.path)?),
        PatchOp::Append => Some(append(current, &patch.value, forbid_duplicates, &patch.path)?),
        PatchOp::Remove => remove(current, &patch.value, &patch.path)?,
    };
    if let Some(value) = updated {
        object.insert(field, value);
    }
    Ok(())
}

fn increment(current: Option<&Value>, operand: &Value, path: &str) -> ProtocolResult<Value> {
    let base = match current {
        None | Some(Value::Null) => Number::from(0),
        Some(Value::Number(n)) => n.clone(),
        Some(other) => {
            return Err(ProtocolError::invalid_patch(format!(
                "cannot increment {} at {path}",
                json_kind(other)
            )))
        }
    };
    let delta = match operand {
        Value::Number(n) => n,
        other => {
            return Err(ProtocolError::invalid_patch(format!(
                "increment operand at {path} must be a number, got {}",
                json_kind(other)
            )))
        }
    };

    if let (Some(a), Some(b)) = (base.as_i64(), delta.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| ProtocolError::invalid_patch(format!("increment overflow at {path}")));
    }

    let sum = base.as_f64().unwrap_or_default() + delta.as_f64().unwrap_or_default();
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| ProtocolError::invalid_patch(format!("non-finite increment at {path}")))
}

fn append(
    current: Option<Value>,
    operand: &Value,
    forbid_duplicates: bool,
    path: &str,
) -> ProtocolResult<Value> {
    match current {
        None | Some(Value::Null) => Ok(Value::Array(vec![operand.clone()])),
        Some(Value::Array(mut items)) => {
            if !(forbid_duplicates && items.contains(operand)) {
                items.push(operand.clone());
            }
            Ok(Value::Array(items))
        }
        Some(Value::String(mut text)) => match operand {
            Value::String(suffix) => {
                text.push_str(suffix);
                Ok(Value::String(text))
            }
            other => Err(ProtocolError::invalid_patch(format!(
                "cannot append {} to string at {path}",
                json_kind(other)
            ))),
        },
        Some(other) => Err(ProtocolError::invalid_patch(format!(
            "cannot append to {} at {path}",
            json_kind(&other)
        ))),
    }
}

fn remove(current: Option<Value>, operand: &Value, path: &str) -> ProtocolResult<Option<Value>> {
    match current {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(mut items)) => {
            if let Some(pos) = items.iter().position(|item| item == operand) {
                items.remove(pos);
            }
            Ok(Some(Value::Array(items)))
        }
        Some(other) => Err(ProtocolError::invalid_patch(format!(
            "cannot remove from {} at {path}",
            json_kind(&other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{FIELD_APPLICATION_ID, FIELD_CREATED};
    use crate::schema::FieldType;
    use proptest::prelude::*;
    use serde_json::json;

    fn post() -> Object {
        let mut object = Object::new("post", "42")
            .with("title", "old")
            .with("views", 0)
            .with(FIELD_APPLICATION_ID, "app");
        object.stamp_created(1_000);
        object
    }

    #[test]
    fn replace_sets_field_and_bumps_modified() {
        let before = post();
        let after = apply_patches(
            &before,
            &[Patch::replace("post/42/title", "x")],
            None,
            1_000,
        )
        .unwrap();

        assert_eq!(after.get("title"), Some(&json!("x")));
        assert!(after.modified().unwrap() > before.modified().unwrap());
        // input is untouched
        assert_eq!(before.get("title"), Some(&json!("old")));
    }

    #[test]
    fn increments_accumulate() {
        let object = post();
        let once = apply_patches(&object, &[Patch::increment("post/42/views", 3)], None, 2_000)
            .unwrap();
        let twice =
            apply_patches(&once, &[Patch::increment("post/42/views", 3)], None, 2_000).unwrap();
        assert_eq!(twice.get("views"), Some(&json!(6)));
    }

    #[test]
    fn increment_promotes_to_float() {
        let object = post();
        let after =
            apply_patches(&object, &[Patch::increment("post/42/views", 1.5)], None, 2_000)
                .unwrap();
        assert_eq!(after.get("views"), Some(&json!(1.5)));
    }

    #[test]
    fn increment_on_string_is_an_error() {
        let result = apply_patches(
            &post(),
            &[Patch::increment("post/42/title", 1)],
            None,
            2_000,
        );
        assert!(matches!(result, Err(ProtocolError::InvalidPatch(_))));
    }

    #[test]
    fn system_fields_are_dropped() {
        let before = post();
        let patches = [
            Patch::replace("post/42/id", "43"),
            Patch::replace("post/42/type", "page"),
            Patch::replace(format!("post/42/{FIELD_CREATED}"), 0),
            Patch::replace(format!("post/42/{FIELD_APPLICATION_ID}"), "other"),
        ];
        let after = apply_patches(&before, &patches, None, 5_000).unwrap();

        let mut expected = before.clone();
        expected.insert("modified", 5_000);
        assert_eq!(after, expected);
    }

    #[test]
    fn append_semantics() {
        let object = post().with("tags", json!(["a"]));
        let patches = [
            Patch::append("post/42/tags", "b"),
            Patch::append("post/42/tags", "a"),
            Patch::append("post/42/title", "er"),
            Patch::append("post/42/links", "http://x"),
        ];
        let after = apply_patches(&object, &patches, None, 2_000).unwrap();
        assert_eq!(after.get("tags"), Some(&json!(["a", "b", "a"])));
        assert_eq!(after.get("title"), Some(&json!("older")));
        assert_eq!(after.get("links"), Some(&json!(["http://x"])));
    }

    #[test]
    fn append_respects_set_fields() {
        let model = ModelDefinition::new("post").with_field("tags", FieldType::Set);
        let object = post().with("tags", json!(["a"]));
        let after = apply_patches(
            &object,
            &[Patch::append("post/42/tags", "a"), Patch::append("post/42/tags", "b")],
            Some(&model),
            2_000,
        )
        .unwrap();
        assert_eq!(after.get("tags"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn remove_first_occurrence_only() {
        let object = post().with("tags", json!(["a", "b", "a"]));
        let after = apply_patches(
            &object,
            &[
                Patch::remove("post/42/tags", "a"),
                Patch::remove("post/42/tags", "zzz"),
                Patch::remove("post/42/missing", "a"),
            ],
            None,
            2_000,
        )
        .unwrap();
        assert_eq!(after.get("tags"), Some(&json!(["b", "a"])));
        assert!(!after.contains("missing"));
    }

    #[test]
    fn malformed_paths() {
        for path in ["post/42", "post//title", "/42/title", "post/42/title/x", ""] {
            assert!(
                PatchPath::parse(path).is_err(),
                "{path:?} should be rejected"
            );
        }
        let parsed = PatchPath::parse("post/42/title").unwrap();
        assert_eq!(parsed.to_string(), "post/42/title");
    }

    #[test]
    fn patch_for_other_object_is_rejected() {
        let result = apply_patches(&post(), &[Patch::replace("post/7/title", "x")], None, 1);
        assert!(result.is_err());
    }

    #[test]
    fn from_json() {
        let patch =
            Patch::from_json(&json!({"op": "increment", "path": "post/1/views", "value": 2}))
                .unwrap();
        assert_eq!(patch.op, PatchOp::Increment);
        assert_eq!(patch.value, json!(2));

        assert!(Patch::from_json(&json!({"path": "post/1/views"})).is_err());
        assert!(Patch::from_json(&json!({"op": "replace"})).is_err());
        assert!(Patch::from_json(&json!({"op": "merge", "path": "a/b/c"})).is_err());
        assert!(Patch::from_json(&json!("replace")).is_err());
    }

    proptest! {
        #[test]
        fn increments_sum(deltas in prop::collection::vec(-1000i64..1000, 0..20)) {
            let patches: Vec<Patch> = deltas
                .iter()
                .map(|d| Patch::increment("post/42/views", *d))
                .collect();
            let after = apply_patches(&post(), &patches, None, 2_000).unwrap();
            prop_assert_eq!(after.get("views"), Some(&json!(deltas.iter().sum::<i64>())));
        }

        #[test]
        fn last_replace_wins(titles in prop::collection::vec("[a-z]{1,8}", 1..10)) {
            let patches: Vec<Patch> = titles
                .iter()
                .map(|t| Patch::replace("post/42/title", t.as_str()))
                .collect();
            let after = apply_patches(&post(), &patches, None, 2_000).unwrap();
            prop_assert_eq!(after.get("title"), Some(&json!(titles.last().unwrap())));
        }
    }
}
