//! Property-based test generators using proptest.

use crate::fixtures::APP;
use proptest::prelude::*;
use relaybase_protocol::{is_system_field, ChannelAddress, Object, ParentRef, Patch};
use serde_json::Value;

/// Strategy for generating user field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}")
        .expect("Invalid regex")
        .prop_filter("System fields are reserved", |s| !is_system_field(s))
}

/// Strategy for generating scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        prop::string::string_regex("[a-z]{0,8}")
            .expect("Invalid regex")
            .prop_map(Value::from),
    ]
}

/// Strategy for generating patches against `model/id`.
///
/// Increments always carry numbers; other operations carry scalars.
pub fn patch_strategy(model: &'static str, id: &'static str) -> impl Strategy<Value = Patch> {
    prop_oneof![
        (field_name_strategy(), scalar_strategy())
            .prop_map(move |(f, v)| Patch::replace(format!("{model}/{id}/{f}"), v)),
        (field_name_strategy(), -100i64..100)
            .prop_map(move |(f, n)| Patch::increment(format!("{model}/{id}/{f}"), n)),
        (field_name_strategy(), scalar_strategy())
            .prop_map(move |(f, v)| Patch::append(format!("{model}/{id}/{f}"), v)),
        (field_name_strategy(), scalar_strategy())
            .prop_map(move |(f, v)| Patch::remove(format!("{model}/{id}/{f}"), v)),
    ]
}

/// Strategy for generating objects of `model` with a few user fields.
pub fn object_strategy(model: &'static str) -> impl Strategy<Value = Object> {
    (
        prop::string::string_regex("[a-z0-9]{1,12}").expect("Invalid regex"),
        prop::collection::btree_map(field_name_strategy(), scalar_strategy(), 0..5),
    )
        .prop_map(move |(id, fields)| {
            fields
                .into_iter()
                .fold(Object::new(model, id), |object, (f, v)| object.with(f, v))
        })
}

/// Strategy for generating legal channel addresses of the fixture
/// application.
pub fn channel_address_strategy() -> impl Strategy<Value = ChannelAddress> {
    let token = || {
        prop::string::string_regex("[a-z0-9]{1,6}")
            .expect("Invalid regex")
            .prop_filter("Suffix words are reserved", |s| s != "deltas" && s != "filter")
    };
    prop_oneof![
        Just(ChannelAddress::new(APP).model("user", None)),
        token().prop_map(|c| ChannelAddress::new(APP).context(&c).model("comment", None)),
        (token(), token()).prop_map(|(c, u)| {
            ChannelAddress::new(APP)
                .context(&c)
                .user(&u)
                .model("comment", None)
        }),
        token().prop_map(|p| {
            ChannelAddress::new(APP)
                .parent(ParentRef::new("post", p))
                .model("comment", None)
        }),
        (token(), token()).prop_map(|(u, p)| {
            ChannelAddress::new(APP)
                .user(&u)
                .parent(ParentRef::new("post", p))
                .model("comment", None)
        }),
        token().prop_map(|id| ChannelAddress::new(APP).model("comment", Some(&id))),
    ]
}
