//! Channel addressing.
//!
//! A [`ChannelAddress`] names a subscribable slice of an application's
//! objects by a combination of dimensions (context, user, model, parent,
//! single id). Only the combinations listed in the legal table form a
//! channel; each has a fixed segment order in its canonical key:
//!
//! | Mask | Dimensions             | Key                                              |
//! |------|------------------------|--------------------------------------------------|
//! | 4    | model (built-in only)  | `blg:{app}:{model}`                              |
//! | 5    | context, model         | `blg:{app}:context:{ctx}:{model}`                |
//! | 7    | context, user, model   | `blg:{app}:context:{ctx}:users:{user}:{model}`   |
//! | 12   | parent, model          | `blg:{app}:{pmodel}:{pid}:{model}`               |
//! | 14   | user, parent, model    | `blg:{app}:users:{user}:{pmodel}:{pid}:{model}`  |
//! | 20   | model, id              | `blg:{app}:{model}:{id}`                         |
//!
//! Any key may carry a `:filter:<base64(json)>` suffix and then a `:deltas`
//! suffix. No segment may contain `:` or be one of the words `deltas` and
//! `filter`.

use crate::error::{ProtocolError, ProtocolResult};
use crate::filter::Filter;
use crate::object::{
    is_builtin_model, parent_field, Object, ParentRef, FIELD_APPLICATION_ID, FIELD_CONTEXT_ID,
    FIELD_ID, FIELD_TYPE, FIELD_USER_ID,
};
use crate::schema::ModelNamespaces;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Prefix of every canonical channel key.
pub const KEY_PREFIX: &str = "blg";

/// Context dimension bit.
pub const MASK_CONTEXT: u8 = 1;
/// User dimension bit.
pub const MASK_USER: u8 = 2;
/// Model dimension bit.
pub const MASK_MODEL: u8 = 4;
/// Parent dimension bit.
pub const MASK_PARENT: u8 = 8;
/// Single-object dimension bit.
pub const MASK_ID: u8 = 16;

const FILTER_MARKER: &str = ":filter:";
const DELTAS_SUFFIX: &str = ":deltas";

/// Words that would read back as a key suffix.
const RESERVED_SEGMENTS: [&str; 2] = ["deltas", "filter"];

#[derive(Debug, Clone, Copy)]
enum Segment {
    Context,
    User,
    Parent,
    Model,
    Id,
}

struct MaskEntry {
    mask: u8,
    segments: &'static [Segment],
}

const LEGAL_MASKS: [MaskEntry; 6] = [
    MaskEntry {
        mask: MASK_MODEL,
        segments: &[Segment::Model],
    },
    MaskEntry {
        mask: MASK_CONTEXT | MASK_MODEL,
        segments: &[Segment::Context, Segment::Model],
    },
    MaskEntry {
        mask: MASK_CONTEXT | MASK_USER | MASK_MODEL,
        segments: &[Segment::Context, Segment::User, Segment::Model],
    },
    MaskEntry {
        mask: MASK_PARENT | MASK_MODEL,
        segments: &[Segment::Parent, Segment::Model],
    },
    MaskEntry {
        mask: MASK_USER | MASK_PARENT | MASK_MODEL,
        segments: &[Segment::User, Segment::Parent, Segment::Model],
    },
    MaskEntry {
        mask: MASK_MODEL | MASK_ID,
        segments: &[Segment::Model, Segment::Id],
    },
];

fn check_segment(segment: &str) -> ProtocolResult<()> {
    if segment.contains(':') || RESERVED_SEGMENTS.contains(&segment) {
        return Err(ProtocolError::invalid_channel(format!(
            "{segment:?} cannot be used as a key segment"
        )));
    }
    Ok(())
}

fn legal_entry(mask: u8) -> Option<&'static MaskEntry> {
    LEGAL_MASKS.iter().find(|entry| entry.mask == mask)
}

/// Returns true if `mask` has an entry in the legal table.
pub fn is_legal_mask(mask: u8) -> bool {
    legal_entry(mask).is_some()
}

/// Canonical string identity of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Wraps a key string as received from a client or the state store.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the key without its filter and deltas suffixes.
    pub fn base(&self) -> ChannelKey {
        let without_deltas = self.0.strip_suffix(DELTAS_SUFFIX).unwrap_or(&self.0);
        let base = match without_deltas.find(FILTER_MARKER) {
            Some(pos) => &without_deltas[..pos],
            None => without_deltas,
        };
        ChannelKey(base.to_string())
    }

    /// Returns true if the key carries a filter or deltas suffix.
    pub fn is_variant(&self) -> bool {
        self.0.contains(FILTER_MARKER) || self.is_deltas()
    }

    /// Returns true if the key carries the deltas suffix.
    pub fn is_deltas(&self) -> bool {
        self.0.ends_with(DELTAS_SUFFIX)
    }

    /// Decodes the filter suffix, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Codec`] if the suffix is not base64 JSON.
    pub fn filter(&self) -> ProtocolResult<Option<Value>> {
        let without_deltas = self.0.strip_suffix(DELTAS_SUFFIX).unwrap_or(&self.0);
        let Some(pos) = without_deltas.find(FILTER_MARKER) else {
            return Ok(None);
        };
        let encoded = &without_deltas[pos + FILTER_MARKER.len()..];
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| ProtocolError::Codec(format!("filter suffix: {e}")))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ProtocolError::Codec(format!("filter suffix: {e}")))
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Address of a subscribable slice of data.
///
/// Built step by step; every dimension step sets its bit in the mask. An
/// empty argument marks the address permanently invalid instead of failing
/// on the spot, so validity is only decided by [`ChannelAddress::is_valid`]
/// and [`ChannelAddress::to_key`].
///
/// ```
/// use relaybase_protocol::{ApplicationSchema, ChannelAddress, ModelDefinition};
///
/// let schema = ApplicationSchema::new("app").with_model(ModelDefinition::new("post"));
/// let key = ChannelAddress::new("app")
///     .context("c1")
///     .model("post", None)
///     .to_key(&schema)
///     .unwrap();
/// assert_eq!(key.as_str(), "blg:app:context:c1:post");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelAddress {
    application_id: String,
    model: Option<String>,
    model_id: Option<String>,
    context: Option<String>,
    user: Option<String>,
    parent: Option<ParentRef>,
    filter: Option<Value>,
    deltas: bool,
    mask: u8,
    force_invalid: bool,
}

impl ChannelAddress {
    /// Starts an address for an application.
    pub fn new(application_id: impl Into<String>) -> Self {
        let application_id = application_id.into();
        Self {
            force_invalid: application_id.is_empty(),
            application_id,
            model: None,
            model_id: None,
            context: None,
            user: None,
            parent: None,
            filter: None,
            deltas: false,
            mask: 0,
        }
    }

    /// Narrows to a model, and optionally a single object of it.
    #[must_use]
    pub fn model(mut self, name: &str, id: Option<&str>) -> Self {
        self.mask |= MASK_MODEL;
        self.force_invalid |= name.is_empty();
        self.model = Some(name.to_string());
        if let Some(id) = id {
            self.mask |= MASK_ID;
            self.force_invalid |= id.is_empty();
            self.model_id = Some(id.to_string());
        }
        self
    }

    /// Narrows to a context.
    #[must_use]
    pub fn context(mut self, id: &str) -> Self {
        self.mask |= MASK_CONTEXT;
        self.force_invalid |= id.is_empty();
        self.context = Some(id.to_string());
        self
    }

    /// Narrows to a user.
    #[must_use]
    pub fn user(mut self, id: &str) -> Self {
        self.mask |= MASK_USER;
        self.force_invalid |= id.is_empty();
        self.user = Some(id.to_string());
        self
    }

    /// Narrows to the children of a parent object.
    #[must_use]
    pub fn parent(mut self, parent: ParentRef) -> Self {
        self.mask |= MASK_PARENT;
        self.force_invalid |= parent.model.is_empty() || parent.id.is_empty();
        self.parent = Some(parent);
        self
    }

    /// Attaches an extra filter; encoded into the key suffix.
    #[must_use]
    pub fn filter(mut self, filter: Value) -> Self {
        self.force_invalid |= !filter.is_object();
        self.filter = Some(filter);
        self
    }

    /// Marks the address as a deltas-only subscription.
    #[must_use]
    pub fn deltas(mut self) -> Self {
        self.deltas = true;
        self
    }

    /// Returns the dimension mask.
    pub fn mask(&self) -> u8 {
        self.mask
    }

    /// Returns the application id.
    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Returns the model name.
    pub fn model_name(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Returns the single-object id.
    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    /// Returns the context id.
    pub fn context_id(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns the user id.
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Returns the parent reference.
    pub fn parent_ref(&self) -> Option<&ParentRef> {
        self.parent.as_ref()
    }

    /// Returns the extra filter.
    pub fn extra_filter(&self) -> Option<&Value> {
        self.filter.as_ref()
    }

    /// Structural validity: not force-invalidated, mask in the legal table,
    /// model-only mask restricted to built-in models.
    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    fn check(&self) -> ProtocolResult<&'static MaskEntry> {
        if self.force_invalid {
            return Err(ProtocolError::invalid_channel(
                "address built with a missing argument",
            ));
        }
        let entry = legal_entry(self.mask).ok_or_else(|| {
            ProtocolError::invalid_channel(format!("mask {} is not a legal combination", self.mask))
        })?;
        let parent = self.parent.as_ref();
        for segment in [
            Some(self.application_id.as_str()),
            self.model.as_deref(),
            self.model_id.as_deref(),
            self.context.as_deref(),
            self.user.as_deref(),
            parent.map(|p| p.model.as_str()),
            parent.map(|p| p.id.as_str()),
        ]
        .into_iter()
        .flatten()
        {
            check_segment(segment)?;
        }
        if self.mask == MASK_MODEL {
            let model = self.model.as_deref().unwrap_or_default();
            if !is_builtin_model(model) {
                return Err(ProtocolError::invalid_channel(format!(
                    "model-only channel requires a built-in model, got {model:?}"
                )));
            }
        }
        Ok(entry)
    }

    /// Renders the canonical key.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidChannel`] if the address is not
    /// valid or a model does not resolve through `lookup`.
    pub fn to_key(&self, lookup: &dyn ModelNamespaces) -> ProtocolResult<ChannelKey> {
        let entry = self.check()?;
        let resolve = |model: &str| {
            let namespace = lookup
                .model_namespace(&self.application_id, model)
                .ok_or_else(|| {
                    ProtocolError::invalid_channel(format!(
                        "unknown model {model:?} in application {}",
                        self.application_id
                    ))
                })?;
            check_segment(&namespace)?;
            Ok::<_, ProtocolError>(namespace)
        };

        let mut parts: Vec<String> = vec![KEY_PREFIX.to_string(), self.application_id.clone()];
        for segment in entry.segments {
            match segment {
                Segment::Context => {
                    parts.push("context".into());
                    parts.push(self.context.clone().unwrap_or_default());
                }
                Segment::User => {
                    parts.push("users".into());
                    parts.push(self.user.clone().unwrap_or_default());
                }
                Segment::Parent => {
                    if let Some(parent) = &self.parent {
                        parts.push(resolve(&parent.model)?);
                        parts.push(parent.id.clone());
                    }
                }
                Segment::Model => {
                    parts.push(resolve(self.model.as_deref().unwrap_or_default())?);
                }
                Segment::Id => parts.push(self.model_id.clone().unwrap_or_default()),
            }
        }

        let mut key = parts.join(":");
        if let Some(filter) = &self.filter {
            let json = serde_json::to_vec(filter)
                .map_err(|e| ProtocolError::Codec(format!("filter: {e}")))?;
            key.push_str(FILTER_MARKER);
            key.push_str(&STANDARD.encode(json));
        }
        if self.deltas {
            key.push_str(DELTAS_SUFFIX);
        }
        Ok(ChannelKey(key))
    }

    /// Renders the address as a filter over the objects it names.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::QueryError`] if the extra filter is malformed.
    pub fn to_filter(&self) -> ProtocolResult<Filter> {
        let mut clauses = vec![Filter::is(FIELD_APPLICATION_ID, self.application_id.as_str())];
        if let Some(model) = &self.model {
            clauses.push(Filter::is(FIELD_TYPE, model.as_str()));
        }
        if let Some(id) = &self.model_id {
            clauses.push(Filter::is(FIELD_ID, id.as_str()));
        }
        if let Some(context) = &self.context {
            clauses.push(Filter::is(FIELD_CONTEXT_ID, context.as_str()));
        }
        if let Some(user) = &self.user {
            clauses.push(Filter::is(FIELD_USER_ID, user.as_str()));
        }
        if let Some(parent) = &self.parent {
            clauses.push(Filter::is(parent_field(&parent.model), parent.id.as_str()));
        }
        if let Some(extra) = &self.filter {
            clauses.push(Filter::from_json(extra)?);
        }
        Ok(Filter::and(clauses))
    }

    /// Enumerates every legal address that `object` belongs to.
    ///
    /// `parent_model` is the parent declared by the object's model, if any.
    /// Objects without `id` or `type` belong to no channel.
    pub fn for_object(
        application_id: &str,
        object: &Object,
        parent_model: Option<&str>,
    ) -> Vec<ChannelAddress> {
        let (Some(model), Some(id)) = (object.model(), object.id()) else {
            return Vec::new();
        };
        let base = || ChannelAddress::new(application_id);
        let mut addresses = Vec::new();

        if is_builtin_model(model) {
            addresses.push(base().model(model, None));
        }
        if let Some(context) = object.context_id() {
            addresses.push(base().context(context).model(model, None));
            if let Some(user) = object.user_id() {
                addresses.push(base().context(context).user(user).model(model, None));
            }
        }
        if let Some(parent) = parent_model {
            if let Some(parent_id) = object.parent_id(parent) {
                let parent_ref = ParentRef::new(parent, parent_id);
                addresses.push(base().parent(parent_ref.clone()).model(model, None));
                if let Some(user) = object.user_id() {
                    addresses.push(base().user(user).parent(parent_ref).model(model, None));
                }
            }
        }
        addresses.push(base().model(model, Some(id)));
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ApplicationSchema, ModelDefinition};
    use serde_json::json;

    fn schema() -> ApplicationSchema {
        ApplicationSchema::new("app")
            .with_model(ModelDefinition::new("post"))
            .with_model(ModelDefinition::new("order"))
            .with_model(
                ModelDefinition::new("comment")
                    .with_namespace("comments")
                    .with_parent("post"),
            )
    }

    fn address_for_mask(mask: u8) -> ChannelAddress {
        let mut address = ChannelAddress::new("app");
        if mask & MASK_CONTEXT != 0 {
            address = address.context("c1");
        }
        if mask & MASK_USER != 0 {
            address = address.user("u1");
        }
        if mask & MASK_PARENT != 0 {
            address = address.parent(ParentRef::new("post", "7"));
        }
        if mask & MASK_MODEL != 0 {
            let id = (mask & MASK_ID != 0).then_some("42");
            address = address.model("user", id);
        }
        address
    }

    #[test]
    fn only_legal_masks_render() {
        let schema = schema();
        for mask in 0u8..32 {
            if mask & MASK_ID != 0 && mask & MASK_MODEL == 0 {
                // the builder only sets ID together with MODEL
                continue;
            }
            let address = address_for_mask(mask);
            assert_eq!(address.mask(), mask);
            let result = address.to_key(&schema);
            if [4, 5, 7, 12, 14, 20].contains(&mask) {
                assert!(result.is_ok(), "mask {mask} should render: {result:?}");
            } else {
                assert!(
                    matches!(result, Err(ProtocolError::InvalidChannel(_))),
                    "mask {mask} should be rejected"
                );
            }
        }
    }

    #[test]
    fn model_only_requires_builtin() {
        let schema = schema();
        let order = ChannelAddress::new("app").model("order", None);
        assert!(!order.is_valid());
        assert!(matches!(
            order.to_key(&schema),
            Err(ProtocolError::InvalidChannel(_))
        ));

        let user = ChannelAddress::new("app").model("user", None);
        assert!(user.is_valid());
        assert_eq!(user.to_key(&schema).unwrap().as_str(), "blg:app:user");
    }

    #[test]
    fn key_grammar() {
        let schema = schema();
        let post7 = ParentRef::new("post", "7");
        let cases = [
            (
                ChannelAddress::new("app").context("c1").model("post", None),
                "blg:app:context:c1:post",
            ),
            (
                ChannelAddress::new("app")
                    .context("c1")
                    .user("u1")
                    .model("post", None),
                "blg:app:context:c1:users:u1:post",
            ),
            (
                ChannelAddress::new("app")
                    .parent(post7.clone())
                    .model("comment", None),
                "blg:app:post:7:comments",
            ),
            (
                ChannelAddress::new("app")
                    .user("u1")
                    .parent(post7)
                    .model("comment", None),
                "blg:app:users:u1:post:7:comments",
            ),
            (
                ChannelAddress::new("app").model("post", Some("42")),
                "blg:app:post:42",
            ),
        ];
        for (address, expected) in cases {
            assert_eq!(address.to_key(&schema).unwrap().as_str(), expected);
        }
    }

    #[test]
    fn missing_argument_forces_invalid() {
        let schema = schema();
        let address = ChannelAddress::new("app").context("").model("post", None);
        assert_eq!(address.mask(), MASK_CONTEXT | MASK_MODEL);
        assert!(!address.is_valid());
        assert!(address.to_key(&schema).is_err());

        assert!(!ChannelAddress::new("app").model("post", Some("")).is_valid());
        assert!(!ChannelAddress::new("")
            .context("c")
            .model("post", None)
            .is_valid());
    }

    #[test]
    fn suffix_words_and_colons_are_not_segments() {
        let schema = schema();
        let post_42 = ChannelAddress::new("app").model("post", Some("42")).deltas();
        let clashes = [
            ChannelAddress::new("app").model("post", Some("deltas")),
            ChannelAddress::new("app").model("post", Some("filter")),
            ChannelAddress::new("app").model("post", Some("42:deltas")),
            ChannelAddress::new("app").context("filter").model("post", None),
            ChannelAddress::new("app").context("c1").user("a:b").model("post", None),
            ChannelAddress::new("app")
                .parent(ParentRef::new("post", "deltas"))
                .model("comment", None),
            ChannelAddress::new("a:pp").context("c1").model("post", None),
        ];
        for address in clashes {
            assert!(!address.is_valid(), "{address:?}");
            assert!(matches!(
                address.to_key(&schema),
                Err(ProtocolError::InvalidChannel(_))
            ));
        }

        let key = post_42.to_key(&schema).unwrap();
        assert_eq!(key.base().as_str(), "blg:app:post:42");
        assert!(ChannelAddress::new("app")
            .model("post", Some("my-deltas"))
            .is_valid());
    }

    #[test]
    fn unknown_model_is_invalid_channel() {
        let address = ChannelAddress::new("app").context("c1").model("widget", None);
        assert!(address.is_valid());
        assert!(matches!(
            address.to_key(&schema()),
            Err(ProtocolError::InvalidChannel(_))
        ));
    }

    #[test]
    fn suffixes() {
        let schema = schema();
        let filter = json!({"author": "alice"});
        let key = ChannelAddress::new("app")
            .context("c1")
            .model("post", None)
            .filter(filter.clone())
            .deltas()
            .to_key(&schema)
            .unwrap();

        assert!(key.as_str().starts_with("blg:app:context:c1:post:filter:"));
        assert!(key.as_str().ends_with(":deltas"));
        assert!(key.is_deltas());
        assert!(key.is_variant());
        assert_eq!(key.base().as_str(), "blg:app:context:c1:post");
        assert_eq!(key.filter().unwrap(), Some(filter));

        let deltas_only = ChannelAddress::new("app")
            .model("post", Some("1"))
            .deltas()
            .to_key(&schema)
            .unwrap();
        assert_eq!(deltas_only.as_str(), "blg:app:post:1:deltas");
        assert_eq!(deltas_only.base().as_str(), "blg:app:post:1");
        assert_eq!(deltas_only.filter().unwrap(), None);
    }

    #[test]
    fn equal_addresses_have_equal_keys() {
        let schema = schema();
        let a = ChannelAddress::new("app").model("post", None).context("c1");
        let b = ChannelAddress::new("app").context("c1").model("post", None);
        assert_eq!(a.to_key(&schema).unwrap(), b.to_key(&schema).unwrap());
    }

    #[test]
    fn for_object_enumerates_channels() {
        let schema = schema();
        let comment = Object::new("comment", "c-9")
            .with(FIELD_CONTEXT_ID, "c1")
            .with(FIELD_USER_ID, "u1")
            .with("post_id", "7");

        let keys: Vec<String> = ChannelAddress::for_object("app", &comment, Some("post"))
            .iter()
            .map(|a| a.to_key(&schema).unwrap().to_string())
            .collect();
        assert_eq!(
            keys,
            vec![
                "blg:app:context:c1:comments",
                "blg:app:context:c1:users:u1:comments",
                "blg:app:post:7:comments",
                "blg:app:users:u1:post:7:comments",
                "blg:app:comments:c-9",
            ]
        );

        let user = Object::new("user", "u1");
        let masks: Vec<u8> = ChannelAddress::for_object("app", &user, None)
            .iter()
            .map(ChannelAddress::mask)
            .collect();
        assert_eq!(masks, vec![MASK_MODEL, MASK_MODEL | MASK_ID]);
    }

    #[test]
    fn to_filter_selects_members() {
        let member = Object::new("comment", "c-9")
            .with(FIELD_APPLICATION_ID, "app")
            .with(FIELD_USER_ID, "u1")
            .with("post_id", "7")
            .with("votes", 3);
        let address = ChannelAddress::new("app")
            .user("u1")
            .parent(ParentRef::new("post", "7"))
            .model("comment", None);

        assert!(address.to_filter().unwrap().matches(&member));

        let other_parent = ChannelAddress::new("app")
            .user("u1")
            .parent(ParentRef::new("post", "8"))
            .model("comment", None);
        assert!(!other_parent.to_filter().unwrap().matches(&member));

        let filtered = address.filter(json!({"range": {"votes": {"gt": 5}}}));
        assert!(!filtered.to_filter().unwrap().matches(&member));
    }
}
