//! Evaluation of the native document query DSL.
//!
//! Supported clauses:
//!
//! | clause | shape |
//! |---|---|
//! | `match_all` | `{"match_all": {}}` |
//! | `bool` | `{"bool": {"must": [..], "should": [..], "must_not": [..]}}` |
//! | `term` | `{"term": {"field": value}}` |
//! | `terms` | `{"terms": {"field": [v1, v2]}}` |
//! | `exists` | `{"exists": {"field": "name"}}` |
//! | `range` | `{"range": {"field": {"gte": 1, "lt": 5}}}` |
//! | `wildcard` | `{"wildcard": {"field": "ab*c?"}}` |
//!
//! A `bool` with a non-empty `should` requires at least one of them to
//! match. `term` against an array field matches if any element is equal.
//! A missing field matches `{"term": {"f": null}}`.

use crate::error::{StorageError, StorageResult};
use relaybase_protocol::{compare_values, Object};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Returns whether `document` satisfies `query`.
pub fn matches(query: &Value, document: &Object) -> StorageResult<bool> {
    let (clause, body) = single_clause(query)?;
    match clause {
        "match_all" => Ok(true),
        "bool" => eval_bool(body, document),
        "term" => {
            let (field, expected) = single_field(body, "term")?;
            Ok(term_matches(document.get(field), expected))
        }
        "terms" => {
            let (field, candidates) = single_field(body, "terms")?;
            let candidates = candidates
                .as_array()
                .ok_or_else(|| invalid("terms expects an array"))?;
            let actual = document.get(field);
            Ok(candidates.iter().any(|c| term_matches(actual, c)))
        }
        "exists" => {
            let field = body
                .get("field")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("exists expects a field name"))?;
            Ok(document.get(field).is_some_and(|v| !v.is_null()))
        }
        "range" => {
            let (field, bounds) = single_field(body, "range")?;
            let bounds = bounds
                .as_object()
                .ok_or_else(|| invalid("range expects an object of bounds"))?;
            eval_range(document.get(field), bounds)
        }
        "wildcard" => {
            let (field, pattern) = single_field(body, "wildcard")?;
            let pattern = pattern
                .as_str()
                .ok_or_else(|| invalid("wildcard expects a string pattern"))?;
            Ok(document
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|text| wildcard(text, pattern)))
        }
        other => Err(invalid(format!("unsupported clause '{other}'"))),
    }
}

/// Orders two documents by `field`. Missing values sort last.
pub fn compare_field(a: &Object, b: &Object, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Glob match with `*` (any run) and `?` (one character).
pub fn wildcard(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern = glob_tokens(pattern);
    let (mut t, mut p) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        let step = match pattern.get(p) {
            Some(Glob::Any) => true,
            Some(Glob::Literal(c)) => *c == text[t],
            _ => false,
        };
        if step {
            t += 1;
            p += 1;
        } else if pattern.get(p) == Some(&Glob::Run) {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|g| *g == Glob::Run)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Glob {
    Literal(char),
    Any,
    Run,
}

/// Splits a wildcard pattern; `\` makes the next character literal.
fn glob_tokens(pattern: &str) -> Vec<Glob> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '*' => Glob::Run,
            '?' => Glob::Any,
            '\\' => Glob::Literal(chars.next().unwrap_or('\\')),
            other => Glob::Literal(other),
        });
    }
    tokens
}

fn eval_bool(body: &Value, document: &Object) -> StorageResult<bool> {
    let body = body
        .as_object()
        .ok_or_else(|| invalid("bool expects an object"))?;
    for key in body.keys() {
        if !matches!(key.as_str(), "must" | "should" | "must_not" | "filter") {
            return Err(invalid(format!("unsupported bool section '{key}'")));
        }
    }

    for clause in section(body, "must")?.iter().chain(section(body, "filter")?) {
        if !matches(clause, document)? {
            return Ok(false);
        }
    }
    for clause in section(body, "must_not")? {
        if matches(clause, document)? {
            return Ok(false);
        }
    }
    let should = section(body, "should")?;
    if should.is_empty() {
        return Ok(true);
    }
    for clause in should {
        if matches(clause, document)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn section<'a>(body: &'a Map<String, Value>, name: &str) -> StorageResult<&'a [Value]> {
    match body.get(name) {
        None => Ok(&[]),
        Some(Value::Array(clauses)) => Ok(clauses),
        Some(_) => Err(invalid(format!("bool.{name} expects an array"))),
    }
}

fn eval_range(actual: Option<&Value>, bounds: &Map<String, Value>) -> StorageResult<bool> {
    let Some(actual) = actual else {
        return Ok(false);
    };
    for (op, bound) in bounds {
        let ord = compare_values(actual, bound);
        let ok = match op.as_str() {
            "gt" => ord == Some(Ordering::Greater),
            "gte" => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
            "lt" => ord == Some(Ordering::Less),
            "lte" => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
            other => return Err(invalid(format!("unsupported range bound '{other}'"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn term_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn single_clause(query: &Value) -> StorageResult<(&str, &Value)> {
    let map = query
        .as_object()
        .ok_or_else(|| invalid("query must be an object"))?;
    let mut entries = map.iter();
    match (entries.next(), entries.next()) {
        (Some((clause, body)), None) => Ok((clause.as_str(), body)),
        _ => Err(invalid("query must have exactly one clause")),
    }
}

fn single_field<'a>(body: &'a Value, clause: &str) -> StorageResult<(&'a str, &'a Value)> {
    let map = body
        .as_object()
        .ok_or_else(|| invalid(format!("{clause} expects an object")))?;
    let mut entries = map.iter();
    match (entries.next(), entries.next()) {
        (Some((field, value)), None) => Ok((field.as_str(), value)),
        _ => Err(invalid(format!("{clause} expects exactly one field"))),
    }
}

fn invalid(message: impl Into<String>) -> StorageError {
    StorageError::InvalidQuery(message.into())
}
