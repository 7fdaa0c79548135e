// File: src/canonical.rs
//
// Canonical JSON serialization and content digests.
// Documents are hashed over their canonical form (sorted keys, no
// insignificant whitespace) so the hash chain is stable across
// implementations and serializer versions.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value canonically: object keys sorted, compact
/// separators, arrays in element order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
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
        other => out.push_str(&other.to_string()),
    }
}

/// SHA-256 digest rendered as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Digest of a JSON value's canonical serialization
pub fn hash_value(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"d": 2, "c": 3}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn canonical_json_preserves_array_order() {
        let value = json!([3, 1, {"z": true, "a": false}]);
        assert_eq!(canonical_json(&value), r#"[3,1,{"a":false,"z":true}]"#);
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let one = json!({"x": 1, "y": [1, 2]});
        let two = json!({"y": [1, 2], "x": 1});
        assert_eq!(hash_value(&one), hash_value(&two));
    }

    #[test]
    fn sha256_hex_is_64_chars() {
        assert_eq!(sha256_hex(b"hello").len(), 64);
    }
}
