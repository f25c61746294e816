use serde_json::Value;

use crate::{Envelope, ValidationError};

/// Canonical byte form of an envelope.
///
/// This is the single serialization used by signing, verification and
/// hashing. Rules: object keys sorted recursively, JSON with no insignificant
/// whitespace, numbers in serde_json's stable formatting, and
/// `meta.signature` excluded.
pub fn canonicalize(envelope: &Envelope) -> Result<Vec<u8>, ValidationError> {
    let mut value = serde_json::to_value(envelope)
        .map_err(|e| ValidationError::at("envelope", e.to_string()))?;
    if let Some(meta) = value.get_mut("meta").and_then(Value::as_object_mut) {
        meta.remove("signature");
    }
    let mut out = Vec::with_capacity(256);
    write_canonical(&value, &mut out);
    Ok(out)
}

/// Canonical bytes of an arbitrary JSON value. Used for activity request
/// hashes and state hashes, which must be order-independent.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                // serde_json string serialization handles escaping.
                out.extend_from_slice(
                    serde_json::to_string(key).expect("string serializes").as_bytes(),
                );
                out.push(b':');
                write_canonical(&map[*key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        leaf => {
            out.extend_from_slice(
                serde_json::to_string(leaf).expect("leaf serializes").as_bytes(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{AgentId, Envelope, MessageType, TaskInvoke};

    fn envelope() -> Envelope {
        Envelope::new(
            MessageType::TaskInvoke,
            AgentId::agent("planner"),
            vec![AgentId::agent("specialist-sel")],
            "wesign",
            "webapp",
            &TaskInvoke {
                task: "extract selectors".to_string(),
                capability: "selector-extraction".to_string(),
                inputs: json!({"z": 1, "a": [3, 2]}),
                attempt_no: 0,
                summary_hint: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn deterministic_across_calls() {
        let env = envelope();
        assert_eq!(canonicalize(&env).unwrap(), canonicalize(&env).unwrap());
    }

    #[test]
    fn keys_sorted_recursively() {
        let bytes = canonical_json_bytes(&json!({"b": {"d": 1, "c": 2}, "a": 3}));
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":3,"b":{"c":2,"d":1}}"#
        );
    }

    #[test]
    fn array_order_preserved() {
        let bytes = canonical_json_bytes(&json!([2, 1, {"b": 1, "a": 2}]));
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"[2,1,{"a":2,"b":1}]"#);
    }

    #[test]
    fn signature_excluded() {
        let mut env = envelope();
        let unsigned = canonicalize(&env).unwrap();
        env.meta.signature = Some("ff".repeat(32));
        assert_eq!(canonicalize(&env).unwrap(), unsigned);
    }

    #[test]
    fn meta_mutation_changes_bytes() {
        let mut env = envelope();
        let before = canonicalize(&env).unwrap();
        env.meta.tenant = "otherco".to_string();
        assert_ne!(canonicalize(&env).unwrap(), before);
    }
}
