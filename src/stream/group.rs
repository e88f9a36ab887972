//! Consumer groups
//!
//! A group is one cursor (`last_delivered_id`) plus the set of records
//! delivered to its consumers and not yet acknowledged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::id::EntryId;

/// A delivered, unacknowledged record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub consumer: String,

    /// Unix millis of the latest delivery
    pub delivered_at: u64,

    pub delivery_count: u32,
}

/// Pending entry together with its id, as reported to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: EntryId,
    pub consumer: String,
    pub delivered_at: u64,
    pub delivery_count: u32,
}

/// Cursor and pending set of one group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerGroup {
    pub last_delivered_id: EntryId,

    #[serde(default)]
    pub pending: BTreeMap<EntryId, PendingEntry>,
}

impl ConsumerGroup {
    pub fn new(start: EntryId) -> Self {
        Self {
            last_delivered_id: start,
            pending: BTreeMap::new(),
        }
    }

    /// Record delivery of `id` to `consumer` and move the cursor forward
    pub fn deliver(&mut self, id: EntryId, consumer: &str, now_ms: u64) {
        let entry = self.pending.entry(id).or_insert_with(|| PendingEntry {
            consumer: consumer.to_string(),
            delivered_at: now_ms,
            delivery_count: 0,
        });
        entry.consumer = consumer.to_string();
        entry.delivered_at = now_ms;
        entry.delivery_count = entry.delivery_count.saturating_add(1);

        if id > self.last_delivered_id {
            self.last_delivered_id = id;
        }
    }

    /// Acknowledge `ids`; returns how many were pending
    ///
    /// The cursor moves to the last id of the list, but never backwards.
    pub fn acknowledge(&mut self, ids: &[EntryId]) -> usize {
        let acked = ids
            .iter()
            .filter(|id| self.pending.remove(*id).is_some())
            .count();

        if let Some(&last) = ids.last() {
            if last > self.last_delivered_id {
                self.last_delivered_id = last;
            }
        }
        acked
    }

    /// Pending ids of `consumer` strictly after `after`
    pub fn pending_for(&self, consumer: &str, after: EntryId) -> Vec<EntryId> {
        self.pending
            .range(after..)
            .filter(|(id, p)| **id > after && p.consumer == consumer)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn pending_info(&self) -> Vec<PendingInfo> {
        self.pending
            .iter()
            .map(|(id, p)| PendingInfo {
                id: *id,
                consumer: p.consumer.clone(),
                delivered_at: p.delivered_at,
                delivery_count: p.delivery_count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(ms: u64) -> EntryId {
        EntryId::new(ms, 0)
    }

    #[test]
    fn test_deliver_advances_cursor() {
        let mut group = ConsumerGroup::new(EntryId::ZERO);
        group.deliver(id(1), "c1", 10);
        group.deliver(id(2), "c1", 10);

        assert_eq!(group.last_delivered_id, id(2));
        assert_eq!(group.pending.len(), 2);
    }

    #[test]
    fn test_acknowledge_counts_only_pending() {
        let mut group = ConsumerGroup::new(EntryId::ZERO);
        group.deliver(id(1), "c1", 10);
        group.deliver(id(2), "c1", 10);

        assert_eq!(group.acknowledge(&[id(1), id(9)]), 1);
        assert_eq!(group.pending.len(), 1);
        assert_eq!(group.last_delivered_id, id(9));
    }

    #[test]
    fn test_acknowledge_never_moves_cursor_back() {
        let mut group = ConsumerGroup::new(EntryId::ZERO);
        group.deliver(id(5), "c1", 10);

        group.acknowledge(&[id(5), id(2)]);
        assert_eq!(group.last_delivered_id, id(5));
    }

    #[test]
    fn test_pending_for_filters_consumer() {
        let mut group = ConsumerGroup::new(EntryId::ZERO);
        group.deliver(id(1), "c1", 10);
        group.deliver(id(2), "c2", 10);
        group.deliver(id(3), "c1", 10);

        assert_eq!(group.pending_for("c1", EntryId::ZERO), vec![id(1), id(3)]);
        assert_eq!(group.pending_for("c1", id(1)), vec![id(3)]);
    }

    #[test]
    fn test_redelivery_bumps_count() {
        let mut group = ConsumerGroup::new(EntryId::ZERO);
        group.deliver(id(1), "c1", 10);
        group.deliver(id(1), "c1", 20);

        let info = group.pending_info();
        assert_eq!(info[0].delivery_count, 2);
        assert_eq!(info[0].delivered_at, 20);
    }
}
