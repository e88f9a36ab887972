//! Load-time record cleanup
//!
//! Two passes run on every record read from disk:
//! - duplicate identifiers are collapsed by a [`ConflictResolver`]
//! - fields declared numeric are re-parsed from strings to numbers

use serde_json::{Number, Value};

/// Outcome of a same-identifier collision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepExisting,
    TakeIncoming,
}

/// Picks the winner when two records share an identifier
///
/// `existing` is the record seen first in the file.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, existing: &Value, incoming: &Value) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Value, &Value) -> Resolution + Send + Sync,
{
    fn resolve(&self, existing: &Value, incoming: &Value) -> Resolution {
        self(existing, incoming)
    }
}

/// Default rule: the record with strictly more populated fields wins,
/// ties keep the first one seen.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompletenessResolver;

impl ConflictResolver for CompletenessResolver {
    fn resolve(&self, existing: &Value, incoming: &Value) -> Resolution {
        if completeness(incoming) > completeness(existing) {
            Resolution::TakeIncoming
        } else {
            Resolution::KeepExisting
        }
    }
}

/// Prefers the record that carries a populated `field` (e.g. a certificate
/// or validation stamp), then falls back to completeness.
#[derive(Debug, Clone)]
pub struct PreferFieldResolver {
    field: String,
}

impl PreferFieldResolver {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    fn has_field(&self, record: &Value) -> bool {
        record
            .get(&self.field)
            .map(is_populated)
            .unwrap_or(false)
    }
}

impl ConflictResolver for PreferFieldResolver {
    fn resolve(&self, existing: &Value, incoming: &Value) -> Resolution {
        match (self.has_field(existing), self.has_field(incoming)) {
            (false, true) => Resolution::TakeIncoming,
            (true, false) => Resolution::KeepExisting,
            _ => CompletenessResolver.resolve(existing, incoming),
        }
    }
}

/// Number of populated top-level fields of an object record
pub fn completeness(record: &Value) -> usize {
    match record {
        Value::Object(map) => map.values().filter(|v| is_populated(v)).count(),
        other if is_populated(other) => 1,
        _ => 0,
    }
}

fn is_populated(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Convert numeric-looking strings back to numbers for the named fields,
/// at any depth. Returns the number of fields converted.
pub fn normalize_numeric_fields(record: &mut Value, fields: &[String]) -> usize {
    if fields.is_empty() {
        return 0;
    }

    match record {
        Value::Object(map) => {
            let mut converted = 0;
            for (name, value) in map.iter_mut() {
                if fields.iter().any(|f| f == name) {
                    if let Some(number) = value.as_str().and_then(parse_number) {
                        *value = Value::Number(number);
                        converted += 1;
                        continue;
                    }
                }
                converted += normalize_numeric_fields(value, fields);
            }
            converted
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|item| normalize_numeric_fields(item, fields))
            .sum(),
        _ => 0,
    }
}

fn parse_number(raw: &str) -> Option<Number> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed != raw {
        return None;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Some(Number::from(int));
    }
    if let Ok(uint) = trimmed.parse::<u64>() {
        return Some(Number::from(uint));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completeness_prefers_fuller_record() {
        let sparse = json!({"id": "a", "amount": null});
        let full = json!({"id": "a", "amount": 5, "memo": "x"});

        assert_eq!(
            CompletenessResolver.resolve(&sparse, &full),
            Resolution::TakeIncoming
        );
        assert_eq!(
            CompletenessResolver.resolve(&full, &sparse),
            Resolution::KeepExisting
        );
    }

    #[test]
    fn test_completeness_tie_keeps_first() {
        let a = json!({"id": "a", "v": 1});
        let b = json!({"id": "a", "v": 2});
        assert_eq!(CompletenessResolver.resolve(&a, &b), Resolution::KeepExisting);
    }

    #[test]
    fn test_prefer_field_beats_completeness() {
        let resolver = PreferFieldResolver::new("certificate");
        let rich = json!({"id": "a", "x": 1, "y": 2, "z": 3});
        let certified = json!({"id": "a", "certificate": "PEM"});

        assert_eq!(resolver.resolve(&rich, &certified), Resolution::TakeIncoming);
        assert_eq!(resolver.resolve(&certified, &rich), Resolution::KeepExisting);
    }

    #[test]
    fn test_closure_resolver() {
        let newest = |a: &Value, b: &Value| {
            if b["rev"].as_u64() > a["rev"].as_u64() {
                Resolution::TakeIncoming
            } else {
                Resolution::KeepExisting
            }
        };
        let resolved = newest.resolve(&json!({"rev": 1}), &json!({"rev": 2}));
        assert_eq!(resolved, Resolution::TakeIncoming);
    }

    #[test]
    fn test_normalize_nested_fields() {
        let mut record = json!({
            "balance": "42",
            "name": "7",
            "history": [{"balance": "1.5"}, {"balance": "n/a"}],
        });
        let fields = vec!["balance".to_string()];

        let converted = normalize_numeric_fields(&mut record, &fields);

        assert_eq!(converted, 2);
        assert_eq!(record["balance"], json!(42));
        assert_eq!(record["name"], json!("7"));
        assert_eq!(record["history"][0]["balance"], json!(1.5));
        assert_eq!(record["history"][1]["balance"], json!("n/a"));
    }

    #[test]
    fn test_normalize_rejects_padded_strings() {
        let mut record = json!({"balance": " 42"});
        let converted = normalize_numeric_fields(&mut record, &["balance".to_string()]);
        assert_eq!(converted, 0);
    }
}
