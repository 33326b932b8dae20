//! Assertion helpers over JSON documents
//!
//! Paths are JSON pointers (`/properties/brightness/type`) so a failure names
//! exactly which field was wrong.

use serde_json::{Map, Value};

use crate::error::{ConformanceError, ConformanceResult};

/// Resolve a JSON pointer, failing if the field is absent
pub fn at<'a>(value: &'a Value, pointer: &str) -> ConformanceResult<&'a Value> {
    value
        .pointer(pointer)
        .ok_or_else(|| ConformanceError::shape(pointer, "a value", "nothing"))
}

/// Require the field at `pointer` to equal `expected`
pub fn expect_value(value: &Value, pointer: &str, expected: &Value) -> ConformanceResult<()> {
    let actual = at(value, pointer)?;
    if !values_match(expected, actual) {
        return Err(ConformanceError::shape(pointer, expected, actual));
    }
    Ok(())
}

/// Require the field at `pointer` to be absent
pub fn expect_absent(value: &Value, pointer: &str) -> ConformanceResult<()> {
    match value.pointer(pointer) {
        None | Some(Value::Null) => Ok(()),
        Some(actual) => Err(ConformanceError::shape(pointer, "no value", actual)),
    }
}

/// The string at `pointer`
pub fn expect_str<'a>(value: &'a Value, pointer: &str) -> ConformanceResult<&'a str> {
    let actual = at(value, pointer)?;
    actual
        .as_str()
        .ok_or_else(|| ConformanceError::shape(pointer, "a string", actual))
}

/// The array at `pointer`
pub fn expect_array<'a>(value: &'a Value, pointer: &str) -> ConformanceResult<&'a Vec<Value>> {
    let actual = at(value, pointer)?;
    actual
        .as_array()
        .ok_or_else(|| ConformanceError::shape(pointer, "an array", actual))
}

/// The object at `pointer`
pub fn expect_object<'a>(
    value: &'a Value,
    pointer: &str,
) -> ConformanceResult<&'a Map<String, Value>> {
    let actual = at(value, pointer)?;
    actual
        .as_object()
        .ok_or_else(|| ConformanceError::shape(pointer, "an object", actual))
}

/// Unwrap a single-key envelope such as `{"fade": {...}}`
///
/// `what` names the envelope in error messages.
pub fn single_key<'a>(value: &'a Value, what: &str) -> ConformanceResult<(&'a str, &'a Value)> {
    let object = value
        .as_object()
        .ok_or_else(|| ConformanceError::shape(what, "an object", value))?;

    let mut entries = object.iter();
    match (entries.next(), entries.next()) {
        (Some((key, inner)), None) => Ok((key.as_str(), inner)),
        _ => Err(ConformanceError::shape(
            what,
            "exactly one key",
            format!("{} keys", object.len()),
        )),
    }
}

/// Compare two JSON values, treating numerically equal numbers as equal
///
/// Servers are free to serialise `50` as `50.0`.
pub fn values_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_match(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, a)| b.get(key).is_some_and(|b| values_match(a, b)))
        }
        _ => expected == actual,
    }
}
