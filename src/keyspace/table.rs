//! KeySpace implementation
//!
//! HashMap-based entry table with RwLock for concurrency.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::clock::{duration_ms, Clock};
use crate::error::{CairnError, Result};
use crate::persistence::{DirtyTracker, DomainRouter, Records};

use super::expiry::ExpiryScheduler;
use super::record::encode_entry;
use super::{Kind, StoredEntry, Value};

/// The scalar/hash/set key space
pub struct KeySpace {
    entries: RwLock<HashMap<String, StoredEntry>>,
    next_version: AtomicU64,

    router: Arc<DomainRouter>,
    tracker: Arc<DirtyTracker>,
    scheduler: Arc<ExpiryScheduler>,
    clock: Arc<dyn Clock>,
}

impl KeySpace {
    pub fn new(
        router: Arc<DomainRouter>,
        tracker: Arc<DirtyTracker>,
        scheduler: Arc<ExpiryScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            router,
            tracker,
            scheduler,
            clock,
        }
    }

    pub fn scheduler(&self) -> &Arc<ExpiryScheduler> {
        &self.scheduler
    }

    // =========================================================================
    // Scalars
    // =========================================================================

    /// Get a scalar value
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read();
        match self.live(&entries, key) {
            None => Ok(None),
            Some(StoredEntry {
                value: Value::Scalar(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(other) => Err(mismatch(key, Kind::Scalar, other.value.kind())),
        }
    }

    /// Store a scalar with no expiration, cancelling any pending one
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write_scalar(key, value, None)
    }

    /// Store a scalar that expires after `ttl`, replacing any pending expiration
    pub fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(CairnError::Precondition(format!(
                "TTL for key '{}' must be positive",
                key
            )));
        }
        self.write_scalar(key, value, Some(ttl))
    }

    fn write_scalar(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write();
        self.purge_expired(&mut entries, key);

        if let Some(existing) = entries.get(key) {
            if existing.value.kind() != Kind::Scalar {
                return Err(mismatch(key, Kind::Scalar, existing.value.kind()));
            }
        }

        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let expires_at = ttl.map(|ttl| self.clock.now_ms().saturating_add(duration_ms(ttl)));

        match expires_at {
            Some(deadline) => self.scheduler.schedule(key, version, deadline),
            None => {
                self.scheduler.cancel(key);
            }
        }

        entries.insert(
            key.to_string(),
            StoredEntry {
                value: Value::Scalar(value.to_string()),
                expires_at,
                version,
            },
        );
        self.touch(key);
        Ok(())
    }

    /// Delete a key of any kind; returns whether it existed
    pub fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        self.purge_expired(&mut entries, key);

        self.scheduler.cancel(key);
        let existed = entries.remove(key).is_some();
        if existed {
            self.touch(key);
        }
        existed
    }

    /// Whether a live key of any kind exists
    pub fn exists(&self, key: &str) -> bool {
        let entries = self.entries.read();
        self.live(&entries, key).is_some()
    }

    // =========================================================================
    // Expiration
    // =========================================================================

    /// Time left before the key expires (`None` if absent or permanent)
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.read();
        let deadline = self.live(&entries, key)?.expires_at?;
        Some(Duration::from_millis(
            deadline.saturating_sub(self.clock.now_ms()),
        ))
    }

    /// Make a key permanent; returns whether an expiration was removed
    pub fn persist(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        self.purge_expired(&mut entries, key);

        match entries.get_mut(key) {
            Some(entry) if entry.expires_at.is_some() => {
                entry.expires_at = None;
                self.scheduler.cancel(key);
                self.touch(key);
                true
            }
            _ => false,
        }
    }

    /// Evict every entry whose timer is due; returns the number evicted
    pub fn run_expirations(&self) -> usize {
        let now = self.clock.now_ms();
        let due = self.scheduler.take_due(now);
        if due.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write();
        let mut evicted = 0;
        for (key, version) in due {
            // Only the logical value the timer was installed for may be evicted
            let still_same = entries
                .get(&key)
                .map_or(false, |e| e.version == version && e.is_expired(now));
            if still_same {
                entries.remove(&key);
                self.touch(&key);
                evicted += 1;
            }
        }
        evicted
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    /// Set a hash field; returns whether the field is new
    pub fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        self.purge_expired(&mut entries, key);

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| self.fresh(Value::Hash(HashMap::new())));
        let found = entry.value.kind();
        let Value::Hash(fields) = &mut entry.value else {
            return Err(mismatch(key, Kind::Hash, found));
        };

        let added = fields.insert(field.to_string(), value.to_string()).is_none();
        self.touch(key);
        Ok(added)
    }

    /// Get a hash field
    pub fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let entries = self.entries.read();
        match self.live(&entries, key) {
            None => Ok(None),
            Some(StoredEntry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.get(field).cloned()),
            Some(other) => Err(mismatch(key, Kind::Hash, other.value.kind())),
        }
    }

    /// All fields of a hash (empty if the key is absent)
    pub fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let entries = self.entries.read();
        match self.live(&entries, key) {
            None => Ok(HashMap::new()),
            Some(StoredEntry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(other) => Err(mismatch(key, Kind::Hash, other.value.kind())),
        }
    }

    /// Remove hash fields; returns how many existed. An emptied hash is deleted.
    pub fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<usize> {
        let mut entries = self.entries.write();
        self.purge_expired(&mut entries, key);

        let Some(entry) = entries.get_mut(key) else {
            return Ok(0);
        };
        let found = entry.value.kind();
        let Value::Hash(map) = &mut entry.value else {
            return Err(mismatch(key, Kind::Hash, found));
        };

        let removed = fields.iter().filter(|f| map.remove(**f).is_some()).count();
        let emptied = map.is_empty();

        if emptied {
            entries.remove(key);
            self.scheduler.cancel(key);
        }
        if removed > 0 || emptied {
            self.touch(key);
        }
        Ok(removed)
    }

    // =========================================================================
    // Sets
    // =========================================================================

    /// Add members to a set; returns how many were new
    pub fn set_add(&self, key: &str, members: &[&str]) -> Result<usize> {
        let mut entries = self.entries.write();
        self.purge_expired(&mut entries, key);

        if members.is_empty() {
            return match entries.get(key) {
                Some(existing) if existing.value.kind() != Kind::Set => {
                    Err(mismatch(key, Kind::Set, existing.value.kind()))
                }
                _ => Ok(0),
            };
        }

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| self.fresh(Value::Set(HashSet::new())));
        let found = entry.value.kind();
        let Value::Set(set) = &mut entry.value else {
            return Err(mismatch(key, Kind::Set, found));
        };

        let added = members
            .iter()
            .filter(|m| set.insert(m.to_string()))
            .count();
        if added > 0 {
            self.touch(key);
        }
        Ok(added)
    }

    /// Remove members from a set; returns how many existed. An emptied set is deleted.
    pub fn set_remove(&self, key: &str, members: &[&str]) -> Result<usize> {
        let mut entries = self.entries.write();
        self.purge_expired(&mut entries, key);

        let Some(entry) = entries.get_mut(key) else {
            return Ok(0);
        };
        let found = entry.value.kind();
        let Value::Set(set) = &mut entry.value else {
            return Err(mismatch(key, Kind::Set, found));
        };

        let removed = members.iter().filter(|m| set.remove(**m)).count();
        let emptied = set.is_empty();

        if emptied {
            entries.remove(key);
            self.scheduler.cancel(key);
        }
        if removed > 0 || emptied {
            self.touch(key);
        }
        Ok(removed)
    }

    /// Whether `member` belongs to the set
    pub fn is_member(&self, key: &str, member: &str) -> Result<bool> {
        self.with_set(key, |set| set.map_or(false, |s| s.contains(member)))
    }

    /// Number of members (0 if the key is absent)
    pub fn cardinality(&self, key: &str) -> Result<usize> {
        self.with_set(key, |set| set.map_or(0, HashSet::len))
    }

    /// All members, in no particular order
    pub fn members(&self, key: &str) -> Result<Vec<String>> {
        self.with_set(key, |set| {
            set.map(|s| s.iter().cloned().collect()).unwrap_or_default()
        })
    }

    fn with_set<T>(&self, key: &str, f: impl FnOnce(Option<&HashSet<String>>) -> T) -> Result<T> {
        let entries = self.entries.read();
        match self.live(&entries, key) {
            None => Ok(f(None)),
            Some(StoredEntry {
                value: Value::Set(set),
                ..
            }) => Ok(f(Some(set))),
            Some(other) => Err(mismatch(key, Kind::Set, other.value.kind())),
        }
    }

    // =========================================================================
    // Inspection / Persistence Support
    // =========================================================================

    /// Live keys starting with `prefix`, sorted
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let now = self.clock.now_ms();
        let entries = self.entries.read();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries
            .read()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an entry read from disk without marking it dirty
    ///
    /// Returns `false` (and marks the key for removal from disk) when the
    /// entry had already expired.
    pub fn restore(&self, key: &str, value: Value, expires_at: Option<u64>) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();

        if expires_at.map_or(false, |deadline| deadline <= now) {
            entries.remove(key);
            self.touch(key);
            return false;
        }

        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        match expires_at {
            Some(deadline) => self.scheduler.schedule(key, version, deadline),
            None => {
                self.scheduler.cancel(key);
            }
        }
        entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                expires_at,
                version,
            },
        );
        true
    }

    /// Encoded records of every live entry routed to `domain`
    pub fn snapshot(&self, domain: &str) -> Records {
        let now = self.clock.now_ms();
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(key, entry)| {
                !entry.is_expired(now) && self.router.entry_domain(key) == domain
            })
            .map(|(key, entry)| (key.clone(), encode_entry(&entry.value, entry.expires_at)))
            .collect()
    }

    /// Drop all entries (used before a reload)
    pub fn clear(&self) {
        self.entries.write().clear();
        self.scheduler.clear();
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn live<'a>(&self, entries: &'a HashMap<String, StoredEntry>, key: &str) -> Option<&'a StoredEntry> {
        entries
            .get(key)
            .filter(|e| !e.is_expired(self.clock.now_ms()))
    }

    /// Remove `key` if its deadline passed, so writes start from scratch
    fn purge_expired(&self, entries: &mut HashMap<String, StoredEntry>, key: &str) {
        let now = self.clock.now_ms();
        if entries.get(key).map_or(false, |e| e.is_expired(now)) {
            entries.remove(key);
            self.scheduler.cancel(key);
            self.touch(key);
        }
    }

    fn fresh(&self, value: Value) -> StoredEntry {
        StoredEntry {
            value,
            expires_at: None,
            version: self.next_version.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn touch(&self, key: &str) {
        self.tracker.mark(self.router.entry_domain(key), key);
    }
}

fn mismatch(key: &str, expected: Kind, found: Kind) -> CairnError {
    CairnError::TypeMismatch {
        key: key.to_string(),
        expected: expected.as_str(),
        found: found.as_str(),
    }
}
