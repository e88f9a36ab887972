//! Persistence Manager
//!
//! Owns every domain file and coordinates reads/writes.
//!
//! ## Responsibilities
//! - Track which keys of which domains changed since their last flush
//! - Load domain files on startup (after legacy migration)
//! - Flush a domain as read-existing → merge-by-id → atomic write-back
//! - Serialize writers of the same domain

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{CairnError, Result};

use super::document::{
    domain_file_path, read_with_fallback, write_document, DocumentSource, DomainDocument, Records,
};
use super::domain::DomainSpec;
use super::legacy::{migrate_legacy, MigrationReport};

/// Produces the current in-memory records of a domain
///
/// Implementations must only hold their own locks for the duration of the
/// call; the manager performs file I/O after it returns.
pub trait RecordSource: Send + Sync {
    fn snapshot(&self, domain: &DomainSpec) -> Records;
}

/// Wake-up sent to the background flusher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSignal {
    Dirty,
}

/// Tracks keys modified since their domain was last flushed
///
/// A domain is dirty while its touched set is non-empty. Touched keys that
/// are absent from the in-memory snapshot at flush time are deleted from
/// the file; every other on-disk key is preserved.
pub struct DirtyTracker {
    touched: Mutex<HashMap<String, HashSet<String>>>,
    signal_tx: Sender<FlushSignal>,
    signal_rx: Receiver<FlushSignal>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        // Capacity 1: repeated signals collapse into a single pending wake-up
        let (signal_tx, signal_rx) = channel::bounded(1);
        Self {
            touched: Mutex::new(HashMap::new()),
            signal_tx,
            signal_rx,
        }
    }

    /// Mark a key of a domain as modified and wake the flusher
    pub fn mark(&self, domain: &str, key: &str) {
        {
            let mut touched = self.touched.lock();
            touched
                .entry(domain.to_string())
                .or_default()
                .insert(key.to_string());
        }
        if let Err(TrySendError::Disconnected(_)) = self.signal_tx.try_send(FlushSignal::Dirty) {
            tracing::trace!("Flush signal channel closed; '{}' stays dirty", domain);
        }
    }

    /// Take the touched keys of a domain, leaving it clean
    pub fn take(&self, domain: &str) -> HashSet<String> {
        self.touched.lock().remove(domain).unwrap_or_default()
    }

    /// Put keys back after a failed flush so the next cycle retries them
    pub fn restore(&self, domain: &str, keys: HashSet<String>) {
        if keys.is_empty() {
            return;
        }
        self.touched
            .lock()
            .entry(domain.to_string())
            .or_default()
            .extend(keys);
    }

    /// Whether a domain has unflushed changes
    pub fn is_dirty(&self, domain: &str) -> bool {
        self.touched
            .lock()
            .get(domain)
            .map_or(false, |keys| !keys.is_empty())
    }

    /// Names of all dirty domains, sorted
    pub fn dirty_domains(&self) -> Vec<String> {
        let touched = self.touched.lock();
        let mut names: Vec<String> = touched
            .iter()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Receiver the background flusher waits on
    pub fn signals(&self) -> Receiver<FlushSignal> {
        self.signal_rx.clone()
    }
}

impl Default for DirtyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of flushing one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub domain: String,

    /// Records in the file after the write
    pub records: usize,

    /// Records removed from the file because their key was deleted in memory
    pub removed: usize,
}

/// Result of a startup load
#[derive(Debug, Default)]
pub struct LoadedDomains {
    /// Decoded documents by domain name (domains without a file are absent)
    pub documents: BTreeMap<String, DomainDocument>,

    /// Domains that were read from their backup copy
    pub from_backup: Vec<String>,

    /// What the legacy migration did
    pub migration: MigrationReport,
}

/// Counters since the manager was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub flushes: u64,
    pub failures: u64,
}

/// Maps in-memory domains to durable files
pub struct PersistenceManager {
    data_dir: PathBuf,
    legacy_path: PathBuf,
    specs: Vec<DomainSpec>,
    sync_writes: bool,
    lock_timeout: Duration,
    clock: Arc<dyn Clock>,

    tracker: Arc<DirtyTracker>,
    source: Arc<dyn RecordSource>,

    /// Flush-in-progress lock per domain
    locks: HashMap<String, Mutex<()>>,

    flushes: AtomicU64,
    failures: AtomicU64,
}

impl PersistenceManager {
    pub fn new(config: &Config, tracker: Arc<DirtyTracker>, source: Arc<dyn RecordSource>) -> Self {
        let locks = config
            .domains
            .iter()
            .map(|spec| (spec.name.clone(), Mutex::new(())))
            .collect();

        Self {
            data_dir: config.data_dir.clone(),
            legacy_path: config.legacy_path(),
            specs: config.domains.clone(),
            sync_writes: config.sync_writes,
            lock_timeout: config.flush_lock_timeout,
            clock: Arc::clone(&config.clock),
            tracker,
            source,
            locks,
            flushes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// File backing a domain
    pub fn domain_path(&self, domain: &str) -> PathBuf {
        domain_file_path(&self.data_dir, domain)
    }

    /// Declared domains
    pub fn specs(&self) -> &[DomainSpec] {
        &self.specs
    }

    /// Look up a domain by name
    pub fn spec(&self, domain: &str) -> Result<&DomainSpec> {
        self.specs
            .iter()
            .find(|spec| spec.name == domain)
            .ok_or_else(|| CairnError::NotFound(format!("domain '{}'", domain)))
    }

    pub fn tracker(&self) -> &Arc<DirtyTracker> {
        &self.tracker
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Startup load
    ///
    /// 1. Create the data directory
    /// 2. Split the legacy combined file into missing domain files
    /// 3. Read every domain file (falling back to its backup)
    pub fn load(&self) -> Result<LoadedDomains> {
        std::fs::create_dir_all(&self.data_dir)?;

        let migration = migrate_legacy(
            &self.legacy_path,
            &self.specs,
            |spec| domain_file_path(&self.data_dir, &spec.name),
            self.clock.now_ms(),
            self.sync_writes,
        )?;

        let mut loaded = LoadedDomains {
            migration,
            ..LoadedDomains::default()
        };

        for spec in &self.specs {
            let path = self.domain_path(&spec.name);
            let Some((document, source)) = read_with_fallback(&path, spec)? else {
                tracing::debug!("Domain '{}': no file yet", spec.name);
                continue;
            };

            if document.duplicates > 0 {
                tracing::warn!(
                    "Domain '{}': resolved {} duplicate record(s) on load",
                    spec.name,
                    document.duplicates
                );
            }
            tracing::debug!(
                "Domain '{}': loaded {} records (lastSaved={:?})",
                spec.name,
                document.records.len(),
                document.last_saved
            );

            if source == DocumentSource::Backup {
                loaded.from_backup.push(spec.name.clone());
            }
            loaded.documents.insert(spec.name.clone(), document);
        }

        Ok(loaded)
    }

    /// Flush one domain now and report the outcome to the caller
    ///
    /// Takes the domain's flush lock (bounded by `flush_lock_timeout`),
    /// snapshots the in-memory records, merges them over the file's current
    /// content and writes the result. On failure the touched keys are put
    /// back so a later flush retries them.
    pub fn flush_domain(&self, domain: &str) -> Result<FlushOutcome> {
        let spec = self.spec(domain)?;
        let lock = self
            .locks
            .get(domain)
            .ok_or_else(|| CairnError::NotFound(format!("domain '{}'", domain)))?;

        let _flushing = lock.try_lock_for(self.lock_timeout).ok_or_else(|| {
            CairnError::Timeout(format!("waiting for flush lock of domain '{}'", domain))
        })?;

        let touched = self.tracker.take(domain);
        let snapshot = self.source.snapshot(spec);

        match self.write_merged(spec, &touched, snapshot) {
            Ok(outcome) => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Flushed domain '{}': {} records, {} removed",
                    outcome.domain,
                    outcome.records,
                    outcome.removed
                );
                Ok(outcome)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.tracker.restore(domain, touched);
                Err(e)
            }
        }
    }

    /// Flush every dirty domain, returning per-domain results
    pub fn flush_dirty(&self) -> Vec<(String, Result<FlushOutcome>)> {
        self.tracker
            .dirty_domains()
            .into_iter()
            .filter(|name| self.locks.contains_key(name))
            .map(|name| {
                let result = self.flush_domain(&name);
                (name, result)
            })
            .collect()
    }

    /// Background variant: failures are logged and left dirty
    ///
    /// Returns `false` if any domain failed.
    pub fn flush_dirty_logged(&self) -> bool {
        let mut ok = true;
        for (domain, result) in self.flush_dirty() {
            if let Err(e) = result {
                tracing::error!("Debounced flush of domain '{}' failed: {}", domain, e);
                ok = false;
            }
        }
        ok
    }

    fn write_merged(
        &self,
        spec: &DomainSpec,
        touched: &HashSet<String>,
        snapshot: Records,
    ) -> Result<FlushOutcome> {
        let path = self.domain_path(&spec.name);

        let mut merged = match read_with_fallback(&path, spec) {
            Ok(Some((document, _))) => document.records,
            Ok(None) => Records::new(),
            Err(CairnError::Serialization(reason)) => {
                tracing::warn!(
                    "Domain '{}': existing file unreadable ({}), rewriting from memory",
                    spec.name,
                    reason
                );
                Records::new()
            }
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for key in touched {
            if !snapshot.contains_key(key) && merged.remove(key).is_some() {
                removed += 1;
            }
        }
        merged.extend(snapshot);

        write_document(&path, &merged, self.clock.now_ms(), self.sync_writes)
            .map_err(|e| CairnError::persistence(&spec.name, e))?;

        Ok(FlushOutcome {
            domain: spec.name.clone(),
            records: merged.len(),
            removed,
        })
    }
}
