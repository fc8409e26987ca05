//! Cache key derivation and canonical hashing.
//!
//! Keys are SHA-256 over a canonical JSON form: object keys sorted at every
//! level, prompt text trimmed and lower-cased, temperature rounded to two
//! decimals. Two logically identical requests hash identically whatever
//! order their fields were built in.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use storyloom_core::{ContentType, GenerationRequest};

/// Hex SHA-256 of a string.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Canonical JSON text of `value`.
///
/// Serialization is written by hand over the sorted form so the output does
/// not depend on whether `serde_json` preserves insertion order.
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
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Hot cache key for a generation request under an operation tag.
pub fn request_key(request: &GenerationRequest, operation: &str) -> String {
    let mut map = Map::new();
    map.insert("prompt".into(), Value::String(normalize_text(&request.prompt)));
    map.insert(
        "system".into(),
        request
            .system_prompt
            .as_deref()
            .map(|s| Value::String(normalize_text(s)))
            .unwrap_or(Value::Null),
    );
    map.insert("model".into(), Value::String(request.model.trim().to_string()));
    map.insert("max_tokens".into(), Value::from(request.max_tokens));
    map.insert(
        "temperature".into(),
        Value::String(format!("{:.2}", request.temperature)),
    );
    map.insert("operation".into(), Value::String(normalize_text(operation)));
    sha256_hex(&canonical_json(&Value::Object(map)))
}

/// Durable record id: one record per (type, owner, metadata) tuple.
pub fn record_id(content_type: ContentType, owner_id: &str, metadata: &Map<String, Value>) -> String {
    let mut map = Map::new();
    map.insert("type".into(), Value::String(content_type.as_str().to_string()));
    map.insert("owner".into(), Value::String(owner_id.to_string()));
    map.insert("metadata".into(), Value::Object(metadata.clone()));
    sha256_hex(&canonical_json(&Value::Object(map)))
}

/// Content fingerprint of a durable record.
pub fn content_fingerprint(record_id: &str, content: &Value) -> String {
    sha256_hex(&format!("{record_id}:{}", canonical_json(content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_order_does_not_matter() {
        let a = json!({"b": 1, "a": {"y": 2, "x": [3, {"q": 1, "p": 2}]}});
        let mut inner = Map::new();
        inner.insert("x".into(), json!([3, {"p": 2, "q": 1}]));
        inner.insert("y".into(), json!(2));
        let mut outer = Map::new();
        outer.insert("a".into(), Value::Object(inner));
        outer.insert("b".into(), json!(1));

        assert_eq!(canonical_json(&a), canonical_json(&Value::Object(outer)));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":[3,{"p":2,"q":1}],"y":2},"b":1}"#);
    }

    #[test]
    fn prompt_is_normalized() {
        let a = GenerationRequest::new("  Write Chapter One ", "openai/gpt-4o-mini");
        let b = GenerationRequest::new("write chapter one", "openai/gpt-4o-mini");
        assert_eq!(request_key(&a, "chapter"), request_key(&b, "chapter"));
    }

    #[test]
    fn settings_change_the_key() {
        let base = GenerationRequest::new("p", "m");
        let key = request_key(&base, "op");
        assert_ne!(key, request_key(&base.clone().with_max_tokens(10), "op"));
        assert_ne!(key, request_key(&base.clone().with_temperature(0.2), "op"));
        assert_ne!(key, request_key(&base.clone().with_system_prompt("s"), "op"));
        assert_ne!(key, request_key(&base, "other"));
        assert_eq!(key.len(), 64);
    }

    #[test]
    fn record_id_ignores_metadata_order() {
        let m1 = json!({"genre": "noir", "chapter": 2});
        let m2 = json!({"chapter": 2, "genre": "noir"});
        assert_eq!(
            record_id(ContentType::ChapterContent, "u1", m1.as_object().unwrap()),
            record_id(ContentType::ChapterContent, "u1", m2.as_object().unwrap())
        );
        assert_ne!(
            record_id(ContentType::ChapterContent, "u1", m1.as_object().unwrap()),
            record_id(ContentType::ChapterOutline, "u1", m1.as_object().unwrap())
        );
    }
}
