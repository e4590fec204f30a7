//! Canonical JSON serialization used for content-addressing (§3, §9).
//!
//! Canonical form: object keys sorted lexicographically at every nesting
//! level, no insignificant whitespace. Stability under key reordering and
//! under `clone()` is relied on by [`crate::model::metadata::Metadata`].

use serde_json::Value;

/// Renders `value` as canonical JSON: sorted object keys, no whitespace.
///
/// Arrays preserve element order (order is semantically meaningful);
/// objects are reordered by key. This mirrors `json.dumps(x, sort_keys=True,
/// separators=(",", ":"))` from the source implementation.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"))
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serialization is infallible"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_output() {
        let a = json!({"b": 1, "a": [{"y": 2, "x": 1}]});
        let b = json!({"a": [{"x": 1, "y": 2}], "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn array_order_is_preserved() {
        let a = json!({"a": [1, 2, 3]});
        let b = json!({"a": [3, 2, 1]});
        assert_ne!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn stable_under_clone() {
        let a = json!({"z": 1, "a": 2, "m": [1, 2, {"q": 1, "p": 2}]});
        let cloned = a.clone();
        assert_eq!(canonical_json(&a), canonical_json(&cloned));
    }
}
