//! Stream Module
//!
//! Named append-only logs with consumer groups.
//!
//! ## Responsibilities
//! - Assign strictly increasing [`EntryId`]s, even within one millisecond
//! - Plain reads from a position, optionally blocking for new records
//! - Consumer groups: a delivery cursor plus exact pending bookkeeping
//!
//! Unacknowledged records are never redelivered automatically; they stay
//! in the group's pending set until acknowledged.

mod group;
mod id;
mod table;

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as Json;

pub use group::{ConsumerGroup, PendingEntry, PendingInfo};
pub use id::{EntryId, GroupReadFrom, ReadFrom};
pub use table::StreamTable;

/// One record of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: EntryId,

    /// Field/value pairs in append order
    #[serde(deserialize_with = "lenient_fields")]
    pub fields: Vec<(String, String)>,
}

impl StreamRecord {
    /// Value of the first field called `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Records read from one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    pub stream: String,
    pub records: Vec<StreamRecord>,
}

/// A stream: its records, the last assigned id and its groups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub last_id: EntryId,

    #[serde(default)]
    pub entries: Vec<StreamRecord>,

    #[serde(default)]
    pub groups: BTreeMap<String, ConsumerGroup>,

    /// Sequence counter for generated ids; starts over with each table
    #[serde(skip)]
    next_seq: u64,
}

impl Stream {
    /// Next generated id: `(now, seq)`, bumped past `last_id` if needed
    ///
    /// Returns `None` once `last_id` is [`EntryId::MAX`].
    fn next_id(&mut self, now_ms: u64) -> Option<EntryId> {
        let mut id = EntryId::new(now_ms.max(self.last_id.ms), self.next_seq);
        if id <= self.last_id {
            id = self.last_id.successor()?;
        }
        self.next_seq = id.seq.saturating_add(1);
        Some(id)
    }

    fn push(&mut self, id: EntryId, fields: Vec<(String, String)>) {
        self.last_id = id;
        self.entries.push(StreamRecord { id, fields });
    }

    fn after(&self, after: EntryId, count: Option<usize>) -> Vec<StreamRecord> {
        records_after(&self.entries, after, count)
    }

    /// Records with `start <= id <= end`
    fn range(&self, start: EntryId, end: EntryId, count: Option<usize>) -> Vec<StreamRecord> {
        let from = self.entries.partition_point(|r| r.id < start);
        self.entries[from..]
            .iter()
            .take_while(|r| r.id <= end)
            .take(limit(count))
            .cloned()
            .collect()
    }
}

/// Maximum records a read returns; `None` and `Some(0)` mean no limit
fn limit(count: Option<usize>) -> usize {
    match count {
        None | Some(0) => usize::MAX,
        Some(c) => c,
    }
}

/// Records of an id-ordered slice with id strictly greater than `after`
fn records_after(entries: &[StreamRecord], after: EntryId, count: Option<usize>) -> Vec<StreamRecord> {
    let start = entries.partition_point(|r| r.id <= after);
    let end = start.saturating_add(limit(count)).min(entries.len());
    entries[start..end].to_vec()
}

/// Record with exactly `id` in an id-ordered slice
fn find_record(entries: &[StreamRecord], id: EntryId) -> Option<&StreamRecord> {
    entries
        .binary_search_by(|r| r.id.cmp(&id))
        .ok()
        .map(|i| &entries[i])
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFields {
    Pairs(Vec<(String, Json)>),
    Map(BTreeMap<String, Json>),
}

/// Field values that were normalized to numbers come back as strings
fn lenient_fields<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    let pairs: Vec<(String, Json)> = match RawFields::deserialize(deserializer)? {
        RawFields::Pairs(pairs) => pairs,
        RawFields::Map(map) => map.into_iter().collect(),
    };

    pairs
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                Json::String(s) => s,
                Json::Number(n) => n.to_string(),
                Json::Bool(b) => b.to_string(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "field '{}' has non-scalar value {}",
                        name, other
                    )))
                }
            };
            Ok((name, value))
        })
        .collect()
}
