//! Entry record codec
//!
//! On-disk shape of one entry:
//! ```text
//! {"type": "scalar", "value": "a", "expiresAt": 1712345678901}
//! {"type": "hash",   "fields": {"f": "1"}}
//! {"type": "set",    "members": ["a", "b"]}
//! ```
//! Older files stored untyped values; those decode as scalar (string,
//! number, bool), hash (any other object) or set (array).

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value as Json};

use super::Value;

/// Encode an entry into its record
pub fn encode_entry(value: &Value, expires_at: Option<u64>) -> Json {
    let mut record = match value {
        Value::Scalar(s) => json!({"type": "scalar", "value": s}),
        Value::Hash(fields) => {
            let fields: Map<String, Json> = fields
                .iter()
                .map(|(k, v)| (k.clone(), Json::String(v.clone())))
                .collect();
            json!({"type": "hash", "fields": fields})
        }
        Value::Set(members) => {
            let mut members: Vec<&String> = members.iter().collect();
            members.sort();
            json!({"type": "set", "members": members})
        }
    };

    if let (Some(deadline), Json::Object(map)) = (expires_at, &mut record) {
        map.insert("expiresAt".to_string(), json!(deadline));
    }
    record
}

/// Decode a record into an entry and its deadline
///
/// Returns `None` for records that cannot be interpreted.
pub fn decode_entry(record: &Json) -> Option<(Value, Option<u64>)> {
    match record {
        Json::Object(map) => {
            let payload = match map.get("type").and_then(Json::as_str) {
                Some("scalar") => map.get("value").map(|v| ("scalar", v)),
                Some("hash") => map.get("fields").map(|v| ("hash", v)),
                Some("set") => map.get("members").map(|v| ("set", v)),
                _ => None,
            };

            // A `type` field without its payload is plain record data
            let Some((kind, payload)) = payload else {
                return Some((Value::Hash(decode_fields(record)?), None));
            };

            let expires_at = map.get("expiresAt").and_then(lenient_u64);
            let value = match kind {
                "scalar" => Value::Scalar(lenient_string(payload)?),
                "hash" => Value::Hash(decode_fields(payload)?),
                _ => Value::Set(decode_members(payload)?),
            };
            Some((value, expires_at))
        }
        Json::Array(_) => Some((Value::Set(decode_members(record)?), None)),
        other => Some((Value::Scalar(lenient_string(other)?), None)),
    }
}

fn decode_fields(value: &Json) -> Option<HashMap<String, String>> {
    value
        .as_object()?
        .iter()
        .map(|(k, v)| Some((k.clone(), lenient_string(v)?)))
        .collect()
}

fn decode_members(value: &Json) -> Option<HashSet<String>> {
    value.as_array()?.iter().map(lenient_string).collect()
}

/// Strings, and numbers/bools that were stored unquoted
fn lenient_string(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lenient_u64(value: &Json) -> Option<u64> {
    match value {
        Json::Number(n) => n.as_u64(),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}
