//! Canonical encoding for gossip signature and message-id computation.
//!
//! The teacher's own code signs string-formatted payload maps, which is
//! non-deterministic across implementations (map iteration order). This
//! fixes a canonical encoding instead: sorted-key JSON of the payload,
//! concatenated with explicit type tags for the envelope fields in a fixed
//! order, then hashed with BLAKE3. Debug/Display formatting of a map must
//! never be used for anything that gets signed or hashed.

use serde_json::Value;
use std::collections::BTreeMap;

/// Re-serializes an arbitrary JSON value with object keys sorted, so two
/// equivalent payloads always produce byte-identical encodings regardless
/// of field insertion order upstream.
pub fn canonicalize_payload(payload: &Value) -> Vec<u8> {
    let sorted = sort_value(payload);
    serde_json::to_vec(&sorted).expect("Value serialization cannot fail")
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            serde_json::to_value(sorted).expect("BTreeMap serialization cannot fail")
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

/// Bytes that get signed and hashed into `message_id`: fixed field order,
/// each field explicitly tagged so the encoding can't be confused with a
/// different field layout that happens to hash the same length.
pub fn signing_bytes(
    msg_type: &str,
    sender: &str,
    timestamp_ns: u64,
    hop_count: u32,
    max_hops: u32,
    payload: &Value,
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"type:");
    buf.extend_from_slice(msg_type.as_bytes());
    buf.extend_from_slice(b"|sender:");
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(b"|timestamp_ns:");
    buf.extend_from_slice(&timestamp_ns.to_be_bytes());
    buf.extend_from_slice(b"|hop_count:");
    buf.extend_from_slice(&hop_count.to_be_bytes());
    buf.extend_from_slice(b"|max_hops:");
    buf.extend_from_slice(&max_hops.to_be_bytes());
    buf.extend_from_slice(b"|payload:");
    buf.extend_from_slice(&canonicalize_payload(payload));
    buf
}

/// `message_id = H(type ‖ sender ‖ timestamp ‖ canonical(payload))`. Notably
/// excludes `hop_count`/`max_hops` so the same logical message keeps one
/// stable id as it is forwarded and its hop_count mutates in transit —
/// that stability is what makes Bloom/timestamp dedup work across hops.
pub fn message_id(msg_type: &str, sender: &str, timestamp_ns: u64, payload: &Value) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"type:");
    buf.extend_from_slice(msg_type.as_bytes());
    buf.extend_from_slice(b"|sender:");
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(b"|timestamp_ns:");
    buf.extend_from_slice(&timestamp_ns.to_be_bytes());
    buf.extend_from_slice(b"|payload:");
    buf.extend_from_slice(&canonicalize_payload(payload));
    blake3::hash(&buf).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_canonical_bytes() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize_payload(&a), canonicalize_payload(&b));
    }

    #[test]
    fn message_id_is_deterministic() {
        let payload = json!({"hash": "abc"});
        let id1 = message_id("chunk_announce", "peer-1", 100, &payload);
        let id2 = message_id("chunk_announce", "peer-1", 100, &payload);
        assert_eq!(id1, id2);
    }

    #[test]
    fn message_id_is_stable_across_hop_count_changes() {
        // hop_count/max_hops mutate as a message is forwarded; message_id
        // must stay fixed so Bloom/timestamp dedup still recognizes it.
        let payload = json!({"hash": "abc"});
        let id = message_id("chunk_announce", "peer-1", 100, &payload);
        let bytes_hop0 = signing_bytes("chunk_announce", "peer-1", 100, 0, 3, &payload);
        let bytes_hop1 = signing_bytes("chunk_announce", "peer-1", 100, 1, 3, &payload);
        assert_ne!(bytes_hop0, bytes_hop1);
        assert_eq!(id, message_id("chunk_announce", "peer-1", 100, &payload));
    }
}
