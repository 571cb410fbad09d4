//! Canonical JSON encoding for content hashing.
//!
//! Audit entries and containment certificates are hashed over a canonical
//! rendering of their content so that two payloads with the same fields
//! hash identically regardless of key insertion order. The rules:
//!
//! - object keys are sorted lexicographically at every nesting level;
//! - no whitespace between tokens;
//! - numbers whose value is integral render without a fractional part;
//! - `null` values are preserved, never omitted;
//! - strings use standard JSON escaping, UTF-8 throughout.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Largest magnitude at which an `f64` still represents every integer
/// exactly. Integral floats beyond this keep their float rendering.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0; // 2^53

/// Render a JSON value in canonical form.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// SHA-256 over the canonical rendering, lowercase hex.
pub fn canonical_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(value).as_bytes());
    hex::encode(hasher.finalize())
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => {
            // serde_json handles escaping; a bare string never fails.
            out.push_str(&serde_json::to_string(s).unwrap_or_default());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

fn write_number(out: &mut String, n: &serde_json::Number) {
    if let Some(f) = n.as_f64() {
        if n.as_i64().is_none()
            && n.as_u64().is_none()
            && f.is_finite()
            && f.fract() == 0.0
            && f.abs() < MAX_EXACT_INT
        {
            out.push_str(&format!("{}", f as i64));
            return;
        }
    }
    out.push_str(&n.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let a = json!({"b": {"y": 2, "x": 1}, "a": 0});
        assert_eq!(canonical_string(&a), r#"{"a":0,"b":{"x":1,"y":2}}"#);
    }

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn integral_floats_render_as_integers() {
        let v = json!({"n": 3.0, "m": 3.5});
        assert_eq!(canonical_string(&v), r#"{"m":3.5,"n":3}"#);
    }

    #[test]
    fn null_is_preserved() {
        let v = json!({"gone": null});
        assert_eq!(canonical_string(&v), r#"{"gone":null}"#);
    }

    #[test]
    fn strings_are_escaped() {
        let v = json!(["quote \" and \\ backslash"]);
        assert_eq!(canonical_string(&v), r#"["quote \" and \\ backslash"]"#);
    }
}
