//! Dot-path field extraction from JSON payloads.
//!
//! Plug firmwares disagree wildly about payload shape, so subscriptions
//! carry the location of each reading as a dot-separated key chain
//! (`"StatusSNS.ENERGY.Power"`). Lookup is strict nested-object
//! traversal; arrays, wildcards, and escapes are not supported.

use serde_json::Value;

/// Walks `path` through nested JSON objects.
///
/// Returns `None` when any segment is missing, an intermediate value is
/// not an object, or the path is empty.
pub fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = payload;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Coerces a JSON value to a float.
///
/// Accepts numbers, numeric strings, and booleans; anything else is
/// treated as absent.
pub(crate) fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Renders a JSON value as state text; null is treated as absent.
pub(crate) fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
