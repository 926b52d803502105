//! Neutral filter trees.
//!
//! Filters are boolean connector nodes (`and`, `or`) over leaf predicates
//! (`is`, `not`, `exists`, `range`, `in_array`, `like`). Stores translate
//! them into their native query language; the in-process evaluator
//! [`Filter::matches`] is used to route deltas to filtered subscriptions.
//!
//! JSON form:
//!
//! ```text
//! {"and": [f, ...]}            {"or": [f, ...]}
//! {"is": {"field": value}}     {"not": {"field": value}}
//! {"exists": "field"}          {"range": {"field": {"gte": 1, "lt": 5}}}
//! {"in_array": {"field": [v, ...]}}
//! {"like": {"field": "pre%"}}
//! {"field": value, ...}        shorthand for an `and` of `is`
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use crate::object::Object;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Bounds of a range predicate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeBounds {
    /// Exclusive lower bound.
    pub gt: Option<Value>,
    /// Inclusive lower bound.
    pub gte: Option<Value>,
    /// Exclusive upper bound.
    pub lt: Option<Value>,
    /// Inclusive upper bound.
    pub lte: Option<Value>,
}

impl RangeBounds {
    fn is_empty(&self) -> bool {
        self.gt.is_none() && self.gte.is_none() && self.lt.is_none() && self.lte.is_none()
    }
}

/// A filter tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// All children must match.
    And(Vec<Filter>),
    /// At least one child must match.
    Or(Vec<Filter>),
    /// Field equals value (or, for array fields, contains it).
    Is {
        /// Field name.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// Negation of [`Filter::Is`].
    Not {
        /// Field name.
        field: String,
        /// Rejected value.
        value: Value,
    },
    /// Field is present and not null.
    Exists {
        /// Field name.
        field: String,
    },
    /// Field lies within bounds.
    Range {
        /// Field name.
        field: String,
        /// Bounds.
        bounds: RangeBounds,
    },
    /// Field equals one of the values.
    InArray {
        /// Field name.
        field: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// Field matches a pattern where `%` is any run and `_` any character.
    Like {
        /// Field name.
        field: String,
        /// Pattern.
        pattern: String,
    },
}

const CONNECTORS: [&str; 2] = ["and", "or"];
const PREDICATES: [&str; 6] = ["is", "not", "exists", "range", "in_array", "like"];

impl Filter {
    /// Creates an `is` predicate.
    pub fn is(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Is {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Creates a `not` predicate.
    pub fn not(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Not {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Creates an `exists` predicate.
    pub fn exists(field: impl Into<String>) -> Self {
        Filter::Exists {
            field: field.into(),
        }
    }

    /// Creates an `and` node, collapsing a single child.
    pub fn and(mut children: Vec<Filter>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Filter::And(children)
        }
    }

    /// Parses the JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::QueryError`] if the tree is malformed.
    pub fn from_json(value: &Value) -> ProtocolResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| ProtocolError::query("filter must be an object"))?;
        if map.is_empty() {
            return Err(ProtocolError::query("empty filter"));
        }

        if map.len() == 1 {
            if let Some((key, body)) = map.iter().next() {
                if CONNECTORS.contains(&key.as_str()) || PREDICATES.contains(&key.as_str()) {
                    return Self::parse_node(key, body);
                }
            }
        }

        let children = map
            .iter()
            .map(|(field, value)| Filter::is(field.clone(), value.clone()))
            .collect();
        let filter = Filter::and(children);
        filter.validate()?;
        Ok(filter)
    }

    fn parse_node(key: &str, body: &Value) -> ProtocolResult<Self> {
        match key {
            "and" | "or" => {
                let items = body
                    .as_array()
                    .ok_or_else(|| ProtocolError::query(format!("{key} expects an array")))?;
                let children = items
                    .iter()
                    .map(Self::from_json)
                    .collect::<ProtocolResult<Vec<_>>>()?;
                let node = if key == "and" {
                    Filter::And(children)
                } else {
                    Filter::Or(children)
                };
                node.validate()?;
                Ok(node)
            }
            "exists" => {
                let field = body
                    .as_str()
                    .ok_or_else(|| ProtocolError::query("exists expects a field name"))?;
                let node = Filter::exists(field);
                node.validate()?;
                Ok(node)
            }
            _ => {
                let (field, operand) = single_entry(key, body)?;
                let node = match key {
                    "is" => Filter::is(field, operand.clone()),
                    "not" => Filter::not(field, operand.clone()),
                    "range" => Filter::Range {
                        field: field.to_string(),
                        bounds: parse_bounds(operand)?,
                    },
                    "in_array" => Filter::InArray {
                        field: field.to_string(),
                        values: operand
                            .as_array()
                            .cloned()
                            .ok_or_else(|| ProtocolError::query("in_array expects an array"))?,
                    },
                    "like" => Filter::Like {
                        field: field.to_string(),
                        pattern: operand
                            .as_str()
                            .map(str::to_string)
                            .ok_or_else(|| ProtocolError::query("like expects a string"))?,
                    },
                    other => return Err(ProtocolError::query(format!("unknown node {other:?}"))),
                };
                node.validate()?;
                Ok(node)
            }
        }
    }

    /// Renders the JSON form.
    pub fn to_json(&self) -> Value {
        let keyed = |op: &str, field: &str, operand: Value| {
            let mut inner = Map::new();
            inner.insert(field.to_string(), operand);
            let mut outer = Map::new();
            outer.insert(op.to_string(), Value::Object(inner));
            Value::Object(outer)
        };
        match self {
            Filter::And(children) => {
                serde_json::json!({ "and": children.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Or(children) => {
                serde_json::json!({ "or": children.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Is { field, value } => keyed("is", field, value.clone()),
            Filter::Not { field, value } => keyed("not", field, value.clone()),
            Filter::Exists { field } => serde_json::json!({ "exists": field }),
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
            Filter::InArray { field, values } => {
                keyed("in_array", field, Value::Array(values.clone()))
            }
            Filter::Like { field, pattern } => {
                keyed("like", field, Value::String(pattern.clone()))
            }
        }
    }

    /// Checks structural validity of the whole tree.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::QueryError`] for empty connectors, empty
    /// field names, range predicates without bounds and empty `in_array`
    /// lists.
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                if children.is_empty() {
                    return Err(ProtocolError::query("connector without children"));
                }
                children.iter().try_for_each(Filter::validate)
            }
            Filter::Is { field, .. }
            | Filter::Not { field, .. }
            | Filter::Exists { field }
            | Filter::Like { field, .. } => check_field(field),
            Filter::Range { field, bounds } => {
                check_field(field)?;
                if bounds.is_empty() {
                    return Err(ProtocolError::query(format!("range on {field} has no bounds")));
                }
                Ok(())
            }
            Filter::InArray { field, values } => {
                check_field(field)?;
                if values.is_empty() {
                    return Err(ProtocolError::query(format!("in_array on {field} is empty")));
                }
                Ok(())
            }
        }
    }

    /// Evaluates the filter against an object.
    pub fn matches(&self, object: &Object) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|c| c.matches(object)),
            Filter::Or(children) => children.iter().any(|c| c.matches(object)),
            Filter::Is { field, value } => field_equals(object.get(field), value),
            Filter::Not { field, value } => !field_equals(object.get(field), value),
            Filter::Exists { field } => !matches!(object.get(field), None | Some(Value::Null)),
            Filter::Range { field, bounds } => object
                .get(field)
                .is_some_and(|v| within(v, bounds)),
            Filter::InArray { field, values } => {
                values.iter().any(|v| field_equals(object.get(field), v))
            }
            Filter::Like { field, pattern } => object
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|text| like(text, pattern)),
        }
    }
}

fn check_field(field: &str) -> ProtocolResult<()> {
    if field.is_empty() {
        Err(ProtocolError::query("empty field name"))
    } else {
        Ok(())
    }
}

fn single_entry<'a>(key: &str, body: &'a Value) -> ProtocolResult<(&'a str, &'a Value)> {
    let map = body
        .as_object()
        .filter(|m| m.len() == 1)
        .ok_or_else(|| ProtocolError::query(format!("{key} expects {{field: operand}}")))?;
    map.iter()
        .next()
        .map(|(k, v)| (k.as_str(), v))
        .ok_or_else(|| ProtocolError::query(format!("{key} expects {{field: operand}}")))
}

fn parse_bounds(value: &Value) -> ProtocolResult<RangeBounds> {
    let map = value
        .as_object()
        .ok_or_else(|| ProtocolError::query("range expects an object of bounds"))?;
    let mut bounds = RangeBounds::default();
    for (name, bound) in map {
        match name.as_str() {
            "gt" => bounds.gt = Some(bound.clone()),
            "gte" => bounds.gte = Some(bound.clone()),
            "lt" => bounds.lt = Some(bound.clone()),
            "lte" => bounds.lte = Some(bound.clone()),
            other => return Err(ProtocolError::query(format!("unknown range bound {other:?}"))),
        }
    }
    Ok(bounds)
}

fn field_equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| scalar_equals(item, expected))
        }
        Some(actual) => scalar_equals(actual, expected),
        None => expected.is_null(),
    }
}

/// Numbers compare by value, so `5` equals `5.0`.
fn scalar_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Orders two scalar JSON values of the same kind.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn within(value: &Value, bounds: &RangeBounds) -> bool {
    let check = |bound: &Option<Value>, accept: fn(Ordering) -> bool| match bound {
        None => true,
        Some(b) => compare_values(value, b).is_some_and(accept),
    };
    check(&bounds.gt, |o| o == Ordering::Greater)
        && check(&bounds.gte, |o| o != Ordering::Less)
        && check(&bounds.lt, |o| o == Ordering::Less)
        && check(&bounds.lte, |o| o != Ordering::Greater)
}

/// Matches `text` against a pattern where `%` is any run and `_` any char.
pub fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((bp, bt)) = backtrack {
            p = bp + 1;
            t = bt + 1;
            backtrack = Some((bp, bt + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}
