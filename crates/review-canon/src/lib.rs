//! Canonical serialization and hashing kit.
//!
//! Every artifact that gets sealed into a proof, a ledger entry, or a
//! contract hash in this workspace goes through [`canonicalize`] first so
//! that two independent implementations hash the same bytes for the same
//! logical value.

use serde::Serialize;
use sha2::{Digest, Sha256};

pub mod merkle;

pub use merkle::{MerkleError, MerkleProof, MerkleTree, ProofStep, Side};

/// Render a JSON value into its canonical textual form: object keys sorted
/// and recursed into, arrays kept in order, no insignificant whitespace,
/// strings JSON-escaped, numbers and booleans stringified verbatim, and
/// `null` emitted literally. Absent (missing) object fields are simply not
/// present in the input map and therefore never appear in the output.
pub fn canonicalize(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => out.push_str(&n.to_string()),
        serde_json::Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string encodes"));
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("key encodes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Canonicalize a serializable value and hash it to lowercase hex SHA-256.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let json = serde_json::to_value(value)?;
    Ok(sha256_hex(canonicalize(&json).as_bytes()))
}

/// Full 64-hex-char SHA-256 digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

/// Truncate a hex hash string to `len` hex characters. Used for the
/// 16-char contract/decision-schema hash and the 32-char execution-proof
/// hash; ledger and Merkle hashes stay full length (64).
pub fn truncate_hash(hash: &str, len: usize) -> String {
    hash.chars().take(len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(canonicalize(&v), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn preserves_array_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonicalize(&v), "[3,1,2]");
    }

    #[test]
    fn nested_objects_sort_recursively() {
        let v = json!({"z": {"y": 1, "x": 2}, "a": 1});
        assert_eq!(canonicalize(&v), r#"{"a":1,"z":{"x":2,"y":1}}"#);
    }

    #[test]
    fn null_is_literal() {
        assert_eq!(canonicalize(&json!(null)), "null");
    }

    #[test]
    fn no_whitespace() {
        let v = json!({"a": [1, 2], "b": "x"});
        assert!(!canonicalize(&v).contains(' '));
    }

    #[test]
    fn truncation_lengths() {
        let h = sha256_hex(b"hello");
        assert_eq!(h.len(), 64);
        assert_eq!(truncate_hash(&h, 16).len(), 16);
        assert_eq!(truncate_hash(&h, 32).len(), 32);
        assert_eq!(truncate_hash(&h, 64), h);
    }

    #[test]
    fn stable_under_reparse_reemit() {
        let v = json!({"c": 3, "a": [1, {"n": null}], "b": "hi\"there"});
        let once = canonicalize(&v);
        let reparsed: serde_json::Value = serde_json::from_str(&once).unwrap();
        let twice = canonicalize(&reparsed);
        assert_eq!(once, twice);
    }

    proptest! {
        #[test]
        fn same_input_same_hash(a in 0u64..1_000_000, b in "[a-z]{1,10}") {
            let v1 = json!({"a": a, "b": b.clone()});
            let v2 = json!({"b": b, "a": a});
            prop_assert_eq!(canonical_hash(&v1).unwrap(), canonical_hash(&v2).unwrap());
        }
    }
}
