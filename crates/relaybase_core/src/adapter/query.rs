//! Translation of filter trees into the document store's query DSL.

use crate::error::CoreResult;
use relaybase_protocol::{Filter, FIELD_APPLICATION_ID, FIELD_TYPE};
use serde_json::{json, Map, Value};

/// Translates a validated filter tree into a native query.
pub fn to_native(filter: &Filter) -> Value {
    match filter {
        Filter::And(children) => json!({"bool": {"must": children.iter().map(to_native).collect::<Vec<_>>()}}),
        Filter::Or(children) => json!({"bool": {"should": children.iter().map(to_native).collect::<Vec<_>>()}}),
        Filter::Is { field, value } => term(field, value),
        Filter::Not { field, value } => json!({"bool": {"must_not": [term(field, value)]}}),
        Filter::Exists { field } => json!({"exists": {"field": field}}),
        Filter::Range { field, bounds } => {
            let mut b = Map::new();
            for (name, bound) in [
                ("gt", &bounds.gt),
                ("gte", &bounds.gte),
                ("lt", &bounds.lt),
                ("lte", &bounds.lte),
            ] {
                if let Some(v) = bound {
                    b.insert(name.to_string(), v.clone());
                }
            }
            keyed("range", field, Value::Object(b))
        }
        Filter::InArray { field, values } => keyed("terms", field, Value::Array(values.clone())),
        Filter::Like { field, pattern } => keyed("wildcard", field, Value::String(glob(pattern))),
    }
}

/// Builds the native query for one model of one application.
///
/// # Errors
///
/// Returns [`crate::CoreError::QueryError`] if `filter` is malformed.
pub fn scoped_query(application_id: &str, model: &str, filter: Option<&Filter>) -> CoreResult<Value> {
    let mut must = vec![
        keyed("term", FIELD_APPLICATION_ID, json!(application_id)),
        keyed("term", FIELD_TYPE, json!(model)),
    ];
    if let Some(filter) = filter {
        filter.validate()?;
        must.push(to_native(filter));
    }
    Ok(json!({"bool": {"must": must}}))
}

/// Rewrites a `like` pattern as a wildcard pattern. Characters that are
/// special to wildcards are escaped so they stay literal.
fn glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' => out.push('*'),
            '_' => out.push('?'),
            '*' | '?' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out
}

fn term(field: &str, value: &Value) -> Value {
    if value.is_null() {
        json!({"bool": {"must_not": [{"exists": {"field": field}}]}})
    } else {
        keyed("term", field, value.clone())
    }
}

fn keyed(clause: &str, field: &str, operand: Value) -> Value {
    let mut inner = Map::new();
    inner.insert(field.to_string(), operand);
    let mut outer = Map::new();
    outer.insert(clause.to_string(), Value::Object(inner));
    Value::Object(outer)
}
