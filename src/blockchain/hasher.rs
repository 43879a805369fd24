use serde_json::Value;
use sha2::{Digest, Sha256};

use super::block::Block;

/// Computes the digest that links a block to its successor
///
/// # Arguments
///
/// * `block` - The block to hash
///
/// # Returns
///
/// The SHA-256 hash of the block's canonical JSON form as a 64 character
/// lowercase hexadecimal string
pub fn digest(block: &Block) -> String {
    sha256_hex(canonical_json(&block.canonical_value()).as_bytes())
}

/// Hashes raw bytes with SHA-256 and hex encodes the result
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Writes a JSON value compactly with object keys sorted at every depth.
///
/// The same logical value always produces the same string, no matter in which
/// order its fields were inserted.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::{Payload, Transaction};
    use serde_json::json;

    fn sample_block() -> Block {
        let mut payload = Payload::new();
        payload.insert("speed".to_string(), json!(80));
        payload.insert("location".to_string(), json!("48.85,2.35"));

        let transaction = Transaction {
            sender: "V1".to_string(),
            payload,
            signature: "abc".to_string(),
            timestamp: 1_700_000_000.25,
        };

        Block {
            index: 2,
            timestamp: 1_700_000_010.5,
            transactions: vec![transaction],
            proof: 35293,
            previous_hash: "0".repeat(64),
        }
    }

    #[test]
    fn test_digest_shape() {
        let hash = digest(&sample_block());
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_digest_is_deterministic() {
        assert_eq!(digest(&sample_block()), digest(&sample_block()));
    }

    #[test]
    fn test_digest_ignores_payload_insertion_order() {
        let mut reordered = sample_block();
        let mut payload = Payload::new();
        payload.insert("location".to_string(), json!("48.85,2.35"));
        payload.insert("speed".to_string(), json!(80));
        reordered.transactions[0].payload = payload;

        assert_eq!(digest(&sample_block()), digest(&reordered));
    }

    #[test]
    fn test_digest_is_sensitive_to_every_field() {
        let baseline = digest(&sample_block());

        let mut changed = sample_block();
        changed.index = 3;
        assert_ne!(digest(&changed), baseline);

        let mut changed = sample_block();
        changed.timestamp += 0.001;
        assert_ne!(digest(&changed), baseline);

        let mut changed = sample_block();
        changed.proof += 1;
        assert_ne!(digest(&changed), baseline);

        let mut changed = sample_block();
        changed.previous_hash = "1".repeat(64);
        assert_ne!(digest(&changed), baseline);

        let mut changed = sample_block();
        changed.transactions[0].signature = "abd".to_string();
        assert_ne!(digest(&changed), baseline);

        let mut changed = sample_block();
        changed.transactions[0].payload.insert("emergency".to_string(), json!(true));
        assert_ne!(digest(&changed), baseline);

        let mut changed = sample_block();
        changed.transactions.clear();
        assert_ne!(digest(&changed), baseline);
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [1, {"y": 2, "x": 3}], "c": "s"}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":"s","z":[1,{"x":3,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
