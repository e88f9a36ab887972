//! StreamTable implementation
//!
//! All streams live behind one mutex. Appends notify a condition variable
//! so blocked readers re-check without polling.
//!
//! ```text
//!   append ──► Mutex<HashMap<name, Stream>> ──► notify_all
//!                         ▲
//!   read / read_group ────┘ (wait_until deadline, re-check on wake)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde_json::Value as Json;

use crate::clock::Clock;
use crate::error::{CairnError, Result};
use crate::persistence::{DirtyTracker, DomainRouter, Records};

use super::group::{ConsumerGroup, PendingInfo};
use super::id::{EntryId, GroupReadFrom, RangeBound, ReadFrom};
use super::{find_record, limit, records_after, Stream, StreamBatch, StreamRecord};

type Streams = HashMap<String, Stream>;

/// Named append-only logs and their consumer groups
pub struct StreamTable {
    streams: Mutex<Streams>,
    appended: Condvar,

    router: Arc<DomainRouter>,
    tracker: Arc<DirtyTracker>,
    clock: Arc<dyn Clock>,
    max_block: Duration,
}

impl StreamTable {
    pub fn new(
        router: Arc<DomainRouter>,
        tracker: Arc<DirtyTracker>,
        clock: Arc<dyn Clock>,
        max_block: Duration,
    ) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            appended: Condvar::new(),
            router,
            tracker,
            clock,
            max_block,
        }
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Append a record; `id` is `*` for a generated id or an explicit id
    /// greater than the stream's last one
    pub fn append(&self, stream: &str, id: &str, fields: &[(&str, &str)]) -> Result<EntryId> {
        if fields.is_empty() {
            return Err(CairnError::Precondition(format!(
                "append to stream '{}' needs at least one field",
                stream
            )));
        }
        let explicit = match id {
            "*" => None,
            raw => Some(EntryId::parse(raw)?),
        };

        let mut streams = self.streams.lock();
        let last_id = streams.get(stream).map_or(EntryId::ZERO, |s| s.last_id);
        if let Some(id) = explicit.filter(|id| *id <= last_id) {
            return Err(CairnError::Precondition(format!(
                "id {} is not greater than the last id {} of stream '{}'",
                id, last_id, stream
            )));
        }

        let entry = streams.entry(stream.to_string()).or_default();
        let id = match explicit {
            Some(id) => id,
            None => entry.next_id(self.clock.now_ms()).ok_or_else(|| {
                CairnError::Precondition(format!(
                    "stream '{}' has reached the largest id",
                    stream
                ))
            })?,
        };

        let fields = fields
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect();
        entry.push(id, fields);

        self.touch(stream);
        drop(streams);
        self.appended.notify_all();

        tracing::trace!("Appended {} to stream '{}'", id, stream);
        Ok(id)
    }

    // =========================================================================
    // Plain Reads
    // =========================================================================

    /// Read records after each `(stream, from)` position
    ///
    /// `from` is `$` (only records appended from now on), `0` or an id
    /// (exclusive). With `block` set and nothing to return, waits for an
    /// append up to `min(block, max_block)`; `Some(0)` waits up to the
    /// ceiling. An elapsed wait returns an empty result.
    pub fn read(
        &self,
        streams: &[(&str, &str)],
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamBatch>> {
        let mut guard = self.streams.lock();

        // `$` is pinned to the tail as of the call, not of each re-check
        let positions: Vec<(&str, EntryId)> = streams
            .iter()
            .map(|(name, from)| {
                let after = match ReadFrom::parse(from)? {
                    ReadFrom::Tail => guard.get(*name).map_or(EntryId::ZERO, |s| s.last_id),
                    ReadFrom::After(id) => id,
                };
                Ok((*name, after))
            })
            .collect::<Result<_>>()?;

        let collect = |streams: &Streams| -> Vec<StreamBatch> {
            positions
                .iter()
                .filter_map(|(name, after)| {
                    let records = streams.get(*name)?.after(*after, count);
                    batch(name, records)
                })
                .collect()
        };

        let batches = collect(&*guard);
        let Some(deadline) = self.deadline(block) else {
            return Ok(batches);
        };
        if !batches.is_empty() {
            return Ok(batches);
        }

        loop {
            let timed_out = self.appended.wait_until(&mut guard, deadline).timed_out();
            let batches = collect(&*guard);
            if !batches.is_empty() || timed_out {
                return Ok(batches);
            }
        }
    }

    /// Records with `start <= id <= end`; `-` and `+` stand for the ends
    pub fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> Result<Vec<StreamRecord>> {
        let start = RangeBound::parse(start)?.resolve();
        let end = RangeBound::parse(end)?.resolve();

        let streams = self.streams.lock();
        Ok(streams
            .get(stream)
            .map(|s| s.range(start, end, count))
            .unwrap_or_default())
    }

    /// Number of records (0 if the stream is absent)
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams.lock().get(stream).map_or(0, |s| s.entries.len())
    }

    pub fn exists(&self, stream: &str) -> bool {
        self.streams.lock().contains_key(stream)
    }

    /// Names of all streams, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.lock().keys().cloned().collect();
        names.sort();
        names
    }

    // =========================================================================
    // Consumer Groups
    // =========================================================================

    /// Create a group whose cursor starts at `start` (`0`, `$` or an id)
    pub fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        create_stream_if_missing: bool,
    ) -> Result<()> {
        let explicit = match start {
            "$" => None,
            raw => Some(EntryId::parse(raw)?),
        };
        let mut streams = self.streams.lock();

        if !streams.contains_key(stream) {
            if !create_stream_if_missing {
                return Err(CairnError::NotFound(format!("stream '{}'", stream)));
            }
            streams.insert(stream.to_string(), Stream::default());
        }
        let Some(entry) = streams.get_mut(stream) else {
            return Err(CairnError::NotFound(format!("stream '{}'", stream)));
        };

        if entry.groups.contains_key(group) {
            return Err(CairnError::AlreadyExists(format!(
                "group '{}' on stream '{}'",
                group, stream
            )));
        }

        let start = explicit.unwrap_or(entry.last_id);
        entry
            .groups
            .insert(group.to_string(), ConsumerGroup::new(start));

        self.touch(stream);
        tracing::debug!("Created group '{}' on stream '{}' at {}", group, stream, start);
        Ok(())
    }

    /// Remove a group; returns whether it existed
    pub fn destroy_group(&self, stream: &str, group: &str) -> Result<bool> {
        let mut streams = self.streams.lock();
        let entry = streams
            .get_mut(stream)
            .ok_or_else(|| CairnError::NotFound(format!("stream '{}'", stream)))?;

        let existed = entry.groups.remove(group).is_some();
        if existed {
            self.touch(stream);
        }
        Ok(existed)
    }

    /// Read on behalf of `consumer` in `group`
    ///
    /// `>` delivers records after the group's cursor, records them as
    /// pending and advances the cursor. An explicit id re-reads the
    /// consumer's own pending records after that id without moving the
    /// cursor. Only `>` reads block.
    pub fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(&str, &str)],
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamBatch>> {
        let requests: Vec<(&str, GroupReadFrom)> = streams
            .iter()
            .map(|(name, from)| Ok((*name, GroupReadFrom::parse(from)?)))
            .collect::<Result<_>>()?;

        let mut guard = self.streams.lock();
        let batches = self.deliver(&mut guard, group, consumer, &requests, count)?;

        let waits = requests
            .iter()
            .any(|(_, from)| *from == GroupReadFrom::Undelivered);
        let deadline = match self.deadline(block) {
            Some(deadline) if waits && batches.is_empty() => deadline,
            _ => return Ok(batches),
        };

        loop {
            let timed_out = self.appended.wait_until(&mut guard, deadline).timed_out();
            let batches = self.deliver(&mut guard, group, consumer, &requests, count)?;
            if !batches.is_empty() || timed_out {
                return Ok(batches);
            }
        }
    }

    /// Acknowledge `ids`; returns how many of them were pending
    pub fn acknowledge(&self, stream: &str, group: &str, ids: &[&str]) -> Result<usize> {
        let ids: Vec<EntryId> = ids
            .iter()
            .map(|raw| EntryId::parse(raw))
            .collect::<Result<_>>()?;

        let mut streams = self.streams.lock();
        let state = group_mut(&mut streams, stream, group)?;
        let before = state.last_delivered_id;
        let acked = state.acknowledge(&ids);
        let changed = acked > 0 || state.last_delivered_id != before;

        if changed {
            self.touch(stream);
        }
        Ok(acked)
    }

    /// Delivered but unacknowledged records of a group, by id
    pub fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingInfo>> {
        let mut streams = self.streams.lock();
        Ok(group_mut(&mut streams, stream, group)?.pending_info())
    }

    /// Cursor of a group
    pub fn last_delivered(&self, stream: &str, group: &str) -> Result<EntryId> {
        let mut streams = self.streams.lock();
        Ok(group_mut(&mut streams, stream, group)?.last_delivered_id)
    }

    // =========================================================================
    // Persistence Support
    // =========================================================================

    /// Serialized streams routed to `domain`
    pub fn snapshot(&self, domain: &str) -> Records {
        let streams = self.streams.lock();
        streams
            .iter()
            .filter(|(name, _)| self.router.stream_domain(name) == domain)
            .filter_map(|(name, stream)| match serde_json::to_value(stream) {
                Ok(value) => Some((name.clone(), value)),
                Err(e) => {
                    tracing::error!("Failed to serialize stream '{}': {}", name, e);
                    None
                }
            })
            .collect()
    }

    /// Install a stream read from disk without marking it dirty
    pub fn restore(&self, name: &str, record: &Json) -> Result<()> {
        let stream: Stream = serde_json::from_value(record.clone())?;
        self.streams.lock().insert(name.to_string(), stream);
        Ok(())
    }

    pub fn clear(&self) {
        self.streams.lock().clear();
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn deliver(
        &self,
        streams: &mut MutexGuard<'_, Streams>,
        group: &str,
        consumer: &str,
        requests: &[(&str, GroupReadFrom)],
        count: Option<usize>,
    ) -> Result<Vec<StreamBatch>> {
        // Every requested group must exist before anything is delivered
        for (name, _) in requests {
            group_mut(streams, name, group)?;
        }

        let now = self.clock.now_ms();
        let mut batches = Vec::new();

        for (name, from) in requests {
            let Some(stream) = streams.get_mut(*name) else {
                continue;
            };
            let Stream {
                entries, groups, ..
            } = stream;
            let Some(state) = groups.get_mut(group) else {
                continue;
            };
            let entries: &[StreamRecord] = entries;

            let records: Vec<StreamRecord> = match *from {
                GroupReadFrom::Undelivered => {
                    records_after(entries, state.last_delivered_id, count)
                }
                GroupReadFrom::PendingAfter(after) => state
                    .pending_for(consumer, after)
                    .into_iter()
                    .take(limit(count))
                    .filter_map(|id| find_record(entries, id).cloned())
                    .collect(),
            };

            for record in &records {
                state.deliver(record.id, consumer, now);
            }
            if let Some(batch) = batch(name, records) {
                self.touch(name);
                batches.push(batch);
            }
        }

        Ok(batches)
    }

    fn deadline(&self, block: Option<Duration>) -> Option<Instant> {
        let bound = match block? {
            d if d.is_zero() => self.max_block,
            d => d.min(self.max_block),
        };
        Some(Instant::now() + bound)
    }

    fn touch(&self, stream: &str) {
        self.tracker.mark(self.router.stream_domain(stream), stream);
    }
}

fn group_mut<'a>(
    streams: &'a mut Streams,
    stream: &str,
    group: &str,
) -> Result<&'a mut ConsumerGroup> {
    streams
        .get_mut(stream)
        .and_then(|s| s.groups.get_mut(group))
        .ok_or_else(|| {
            CairnError::NotFound(format!("group '{}' on stream '{}'", group, stream))
        })
}

fn batch(stream: &str, records: Vec<StreamRecord>) -> Option<StreamBatch> {
    if records.is_empty() {
        return None;
    }
    Some(StreamBatch {
        stream: stream.to_string(),
        records,
    })
}
