//! Deep-merge utilities for JSON objects.
//!
//! Stage outputs accumulate as the pipeline escalates; the synthesis
//! stage folds them together with [`deep_merge`]. Conflicts resolve
//! according to a [`MergeStrategy`].

use miette::Diagnostic;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while merging JSON values.
#[derive(Debug, Error, Diagnostic)]
pub enum JsonError {
    /// Two values at the same path could not be reconciled.
    #[error("merge conflict at '{path}': cannot merge {left_kind} with {right_kind}")]
    #[diagnostic(code(echelon::json::merge_conflict))]
    MergeConflict {
        path: String,
        left_kind: &'static str,
        right_kind: &'static str,
    },
}

/// Strategy for handling conflicts during JSON merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Keep the left operand when values conflict.
    PreferLeft,
    /// Keep the right operand when values conflict.
    PreferRight,
    /// Recurse into objects, concatenate arrays, fail on scalar mismatch.
    Deep,
}

/// Deep-merge two JSON values.
///
/// Objects merge key-wise; arrays and scalars resolve per the strategy.
///
/// ```
/// use echelon::utils::json_ext::{deep_merge, MergeStrategy};
/// use serde_json::json;
///
/// let left = json!({"a": 1, "nested": {"x": 10}});
/// let right = json!({"nested": {"y": 20}, "b": 2});
/// let merged = deep_merge(&left, &right, MergeStrategy::Deep).unwrap();
/// assert_eq!(merged, json!({"a": 1, "b": 2, "nested": {"x": 10, "y": 20}}));
/// ```
pub fn deep_merge(
    left: &Value,
    right: &Value,
    strategy: MergeStrategy,
) -> Result<Value, JsonError> {
    merge_at(left, right, strategy, "")
}

/// Merge `overlay` into `base` in place, preferring overlay values.
///
/// Used for folding a stage's output over the running pipeline state.
pub fn overlay_map(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                overlay_map(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn merge_at(
    left: &Value,
    right: &Value,
    strategy: MergeStrategy,
    path: &str,
) -> Result<Value, JsonError> {
    match (left, right) {
        (Value::Object(lo), Value::Object(ro)) => {
            let mut merged = Map::new();
            for (key, lv) in lo {
                let child = join_path(path, key);
                match ro.get(key) {
                    Some(rv) => {
                        merged.insert(key.clone(), merge_at(lv, rv, strategy, &child)?);
                    }
                    None => {
                        merged.insert(key.clone(), lv.clone());
                    }
                }
            }
            for (key, rv) in ro {
                if !lo.contains_key(key) {
                    merged.insert(key.clone(), rv.clone());
                }
            }
            Ok(Value::Object(merged))
        }
        (Value::Array(la), Value::Array(ra)) => match strategy {
            MergeStrategy::PreferLeft => Ok(Value::Array(la.clone())),
            MergeStrategy::PreferRight => Ok(Value::Array(ra.clone())),
            MergeStrategy::Deep => {
                let mut out = la.clone();
                out.extend(ra.iter().cloned());
                Ok(Value::Array(out))
            }
        },
        (lv, rv) if lv == rv => Ok(lv.clone()),
        (lv, rv) => match strategy {
            MergeStrategy::PreferLeft => Ok(lv.clone()),
            MergeStrategy::PreferRight => Ok(rv.clone()),
            MergeStrategy::Deep => Err(JsonError::MergeConflict {
                path: path.to_string(),
                left_kind: kind_of(lv),
                right_kind: kind_of(rv),
            }),
        },
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Read a nested boolean at a dotted path, defaulting to `false`.
///
/// Compliance rules use this to probe detail payloads like
/// `emergence_analysis.emergence_detected` without unwrapping layers of
/// options at every call site.
pub fn nested_flag(map: &Map<String, Value>, dotted: &str) -> bool {
    let mut cursor: Option<&Value> = None;
    for part in dotted.split('.') {
        let next = match cursor {
            None => map.get(part),
            Some(v) => v.as_object().and_then(|o| o.get(part)),
        };
        match next {
            Some(v) => cursor = Some(v),
            None => return false,
        }
    }
    cursor.and_then(Value::as_bool).unwrap_or(false)
}

/// Read a nested string at a dotted path.
pub fn nested_str<'a>(map: &'a Map<String, Value>, dotted: &str) -> Option<&'a str> {
    let mut cursor: Option<&Value> = None;
    for part in dotted.split('.') {
        let next = match cursor {
            None => map.get(part),
            Some(v) => v.as_object().and_then(|o| o.get(part)),
        };
        cursor = Some(next?);
    }
    cursor.and_then(Value::as_str)
}
