//! Canonical JSON serialization and content hashing.
//!
//! Replay parity rests on every component hashing the same bytes for the
//! same payload: object keys sorted recursively, compact separators, UTF-8.
//! The writer below is the single source of those bytes; `payload_hash` and
//! the determinism hashes are SHA-256 over its output.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value canonically: keys sorted at every depth, `,` and
/// `:` separators with no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // serde_json's Display for numbers is already minimal (no trailing
        // zeros, no positive sign), which is what we canonicalize to.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // Reuse serde_json's escaping rules for string leaves.
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()));
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
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string()));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Hex-encoded SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// The payload hash recorded on every log row: SHA-256 over the canonical
/// JSON of the payload object.
pub fn payload_hash(payload: &Value) -> String {
    sha256_hex(canonical_json(payload).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let v = json!({"b": 1, "a": {"z": true, "m": [3, 1]}});
        assert_eq!(canonical_json(&v), r#"{"a":{"m":[3,1],"z":true},"b":1}"#);
    }

    #[test]
    fn separators_are_compact() {
        let v = json!({"k": [1, 2], "s": "x"});
        assert_eq!(canonical_json(&v), r#"{"k":[1,2],"s":"x"}"#);
    }

    #[test]
    fn strings_keep_json_escaping() {
        let v = json!({"t": "a\"b\nc"});
        assert_eq!(canonical_json(&v), r#"{"t":"a\"b\nc"}"#);
    }

    #[test]
    fn hash_is_stable_under_key_order() {
        let a = json!({"title": "hello", "id": "n1"});
        let b = json!({"id": "n1", "title": "hello"});
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn hash_differs_for_different_content() {
        let a = json!({"id": "n1"});
        let b = json!({"id": "n2"});
        assert_ne!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn empty_object_hash_matches_known_vector() {
        // sha256("{}")
        assert_eq!(
            payload_hash(&json!({})),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }
}
