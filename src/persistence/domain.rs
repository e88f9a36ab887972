//! Domain definitions and key routing
//!
//! A domain is a named partition of the logical state backed by exactly
//! one file. Entry keys and stream names are routed to domains by prefix.

use std::fmt;
use std::sync::Arc;

use super::resolve::{CompletenessResolver, ConflictResolver};

/// What a domain holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainKind {
    /// Scalar, hash and set entries keyed by entry key
    Entries,

    /// Stream snapshots keyed by stream name
    Streams,
}

/// Declaration of a single domain
#[derive(Clone)]
pub struct DomainSpec {
    /// Domain name, also the file stem (`{name}.json`)
    pub name: String,

    /// What kind of records the domain holds
    pub kind: DomainKind,

    /// Keys (or stream names) starting with one of these prefixes belong here
    pub key_prefixes: Vec<String>,

    /// Field carrying the record identifier when records are stored as an array
    pub id_field: String,

    /// Fields re-parsed from numeric-looking strings to numbers on load
    pub numeric_fields: Vec<String>,

    /// Top-level key of this domain's section in the legacy combined file
    pub legacy_key: Option<String>,

    /// Rule for same-identifier collisions on load
    pub resolver: Arc<dyn ConflictResolver>,
}

impl DomainSpec {
    /// A domain with no prefixes and the default conflict rule
    pub fn new(name: impl Into<String>, kind: DomainKind) -> Self {
        Self {
            name: name.into(),
            kind,
            key_prefixes: Vec::new(),
            id_field: "id".to_string(),
            numeric_fields: Vec::new(),
            legacy_key: None,
            resolver: Arc::new(CompletenessResolver),
        }
    }

    /// Route keys with this prefix to the domain
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefixes.push(prefix.into());
        self
    }

    /// Override the identifier field used for array-form records
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    /// Re-parse this field as a number on load
    pub fn with_numeric_field(mut self, field: impl Into<String>) -> Self {
        self.numeric_fields.push(field.into());
        self
    }

    /// Read this domain from a differently named legacy section
    pub fn with_legacy_key(mut self, key: impl Into<String>) -> Self {
        self.legacy_key = Some(key.into());
        self
    }

    /// Section name in the legacy combined file
    pub fn legacy_section(&self) -> &str {
        self.legacy_key.as_deref().unwrap_or(&self.name)
    }

    /// Replace the conflict-resolution rule
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

impl fmt::Debug for DomainSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("key_prefixes", &self.key_prefixes)
            .field("id_field", &self.id_field)
            .field("numeric_fields", &self.numeric_fields)
            .field("legacy_key", &self.legacy_key)
            .finish_non_exhaustive()
    }
}

/// Maps keys and stream names to their domain
#[derive(Debug, Clone)]
pub struct DomainRouter {
    /// (prefix, domain) pairs for entries, longest prefix first
    entry_prefixes: Vec<(String, String)>,

    /// (prefix, domain) pairs for streams, longest prefix first
    stream_prefixes: Vec<(String, String)>,

    default_entries: String,
    default_streams: String,
}

impl DomainRouter {
    /// Build a router from domain specs
    pub fn new(specs: &[DomainSpec], default_entries: &str, default_streams: &str) -> Self {
        let mut entry_prefixes = Vec::new();
        let mut stream_prefixes = Vec::new();

        for spec in specs {
            let target = match spec.kind {
                DomainKind::Entries => &mut entry_prefixes,
                DomainKind::Streams => &mut stream_prefixes,
            };
            for prefix in &spec.key_prefixes {
                target.push((prefix.clone(), spec.name.clone()));
            }
        }

        entry_prefixes.sort_by(|a: &(String, String), b| b.0.len().cmp(&a.0.len()));
        stream_prefixes.sort_by(|a: &(String, String), b| b.0.len().cmp(&a.0.len()));

        Self {
            entry_prefixes,
            stream_prefixes,
            default_entries: default_entries.to_string(),
            default_streams: default_streams.to_string(),
        }
    }

    /// Domain owning an entry key
    pub fn entry_domain(&self, key: &str) -> &str {
        Self::route(&self.entry_prefixes, key).unwrap_or(&self.default_entries)
    }

    /// Domain owning a stream
    pub fn stream_domain(&self, stream: &str) -> &str {
        Self::route(&self.stream_prefixes, stream).unwrap_or(&self.default_streams)
    }

    fn route<'a>(prefixes: &'a [(String, String)], key: &str) -> Option<&'a str> {
        prefixes
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, domain)| domain.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let specs = vec![
            DomainSpec::new("keyspace", DomainKind::Entries),
            DomainSpec::new("streams", DomainKind::Streams),
            DomainSpec::new("balances", DomainKind::Entries).with_prefix("bal:"),
            DomainSpec::new("vip", DomainKind::Entries).with_prefix("bal:vip:"),
            DomainSpec::new("events", DomainKind::Streams).with_prefix("ev:"),
        ];
        let router = DomainRouter::new(&specs, "keyspace", "streams");

        assert_eq!(router.entry_domain("bal:alice"), "balances");
        assert_eq!(router.entry_domain("bal:vip:bob"), "vip");
        assert_eq!(router.entry_domain("other"), "keyspace");
        assert_eq!(router.stream_domain("ev:orders"), "events");
        assert_eq!(router.stream_domain("bal:alice"), "streams");
    }
}
