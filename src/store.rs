//! Store Facade
//!
//! The single entry point other modules call.
//!
//! ## Responsibilities
//! - Lifecycle: `connect` loads every domain and starts the background
//!   workers, `quit` performs a final best-effort flush and stops them
//! - Route Entry Table and Stream Table calls, rejecting them while the
//!   store is not connected
//! - Expose immediate, caller-visible flushes (`save_domain_now`)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as Json;

use crate::config::{Config, DEFAULT_ENTRY_DOMAIN, DEFAULT_STREAM_DOMAIN};
use crate::error::{CairnError, Result};
use crate::keyspace::{decode_entry, ExpiryScheduler, ExpiryWorker, KeySpace};
use crate::persistence::{
    DirtyTracker, DomainKind, DomainRouter, DomainSpec, FlushOutcome, FlushWorker,
    LoadedDomains, PersistenceManager, PersistenceStats, RecordSource, Records,
};
use crate::stream::{EntryId, PendingInfo, StreamBatch, StreamRecord, StreamTable};

/// Snapshot source handed to the persistence manager
struct Tables {
    keyspace: Arc<KeySpace>,
    streams: Arc<StreamTable>,
}

impl RecordSource for Tables {
    fn snapshot(&self, domain: &DomainSpec) -> Records {
        match domain.kind {
            DomainKind::Entries => self.keyspace.snapshot(&domain.name),
            DomainKind::Streams => self.streams.snapshot(&domain.name),
        }
    }
}

/// Background threads that run while the store is connected
struct Workers {
    flusher: FlushWorker,
    expiry: ExpiryWorker,
}

/// What `connect` found on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReport {
    pub entries: usize,
    pub streams: usize,

    /// Records skipped because they could not be decoded
    pub skipped: usize,

    /// Entries dropped because their deadline had passed
    pub expired: usize,

    /// Domains restored from their backup copy
    pub from_backup: Vec<String>,

    /// Domains written by the legacy migration
    pub migrated: Vec<String>,

    /// Records found in a domain file other than the one their key routes
    /// to; each is removed from that file on the next flush
    pub rehomed: usize,
}

/// The embedded store
///
/// ## Concurrency Model
///
/// - Entry Table operations serialize on the keyspace `RwLock`
/// - Stream operations serialize on the stream table `Mutex`; blocking
///   reads release it while waiting
/// - The flusher snapshots a domain under those locks, then does file I/O
///   without them
///
/// Share it between threads behind an `Arc<Store>`.
pub struct Store {
    config: Config,
    router: Arc<DomainRouter>,

    keyspace: Arc<KeySpace>,
    streams: Arc<StreamTable>,
    persistence: Arc<PersistenceManager>,

    workers: Mutex<Option<Workers>>,
    ready: AtomicBool,
}

impl Store {
    /// Build a store over `config` without touching the disk
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let router = Arc::new(DomainRouter::new(
            &config.domains,
            DEFAULT_ENTRY_DOMAIN,
            DEFAULT_STREAM_DOMAIN,
        ));
        let tracker = Arc::new(DirtyTracker::new());
        let scheduler = Arc::new(ExpiryScheduler::new(Arc::clone(&config.clock)));

        let keyspace = Arc::new(KeySpace::new(
            Arc::clone(&router),
            Arc::clone(&tracker),
            scheduler,
            Arc::clone(&config.clock),
        ));
        let streams = Arc::new(StreamTable::new(
            Arc::clone(&router),
            Arc::clone(&tracker),
            Arc::clone(&config.clock),
            config.max_block,
        ));

        let tables: Arc<dyn RecordSource> = Arc::new(Tables {
            keyspace: Arc::clone(&keyspace),
            streams: Arc::clone(&streams),
        });
        let persistence = Arc::new(PersistenceManager::new(&config, tracker, tables));

        Ok(Self {
            config,
            router,
            keyspace,
            streams,
            persistence,
            workers: Mutex::new(None),
            ready: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load every domain and start the background workers
    ///
    /// On connect:
    /// 1. Migrate the legacy combined file into missing domain files
    /// 2. Read each domain file (or its backup)
    /// 3. Populate the Entry and Stream tables
    /// 4. Start the flusher and expiry threads, then report ready
    pub fn connect(&self) -> Result<ConnectReport> {
        let mut workers = self.workers.lock();
        if self.is_ready() {
            return Ok(ConnectReport::default());
        }

        self.keyspace.clear();
        self.streams.clear();

        let loaded = self.persistence.load()?;
        let report = self.populate(loaded);

        let flusher = FlushWorker::spawn(
            Arc::clone(&self.persistence),
            self.config.flush_delay,
            self.config.max_flush_delay,
        )?;
        let expiry = ExpiryWorker::spawn(Arc::clone(&self.keyspace), self.config.expiry_poll)?;
        *workers = Some(Workers { flusher, expiry });

        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(
            "Store connected at {:?}: {} entries, {} streams",
            self.config.data_dir,
            report.entries,
            report.streams
        );
        Ok(report)
    }

    /// Liveness check
    pub fn ping(&self) -> Result<&'static str> {
        self.ensure_ready()?;
        Ok("PONG")
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Final best-effort flush of every dirty domain, then stop the workers
    ///
    /// Flush failures are logged, not returned. Blocked stream reads run
    /// until their own bound elapses.
    pub fn quit(&self) {
        let mut workers = self.workers.lock();
        if !self.ready.swap(false, Ordering::SeqCst) {
            return;
        }

        let running = workers.take();
        if let Some(running) = &running {
            if !running.flusher.is_running() {
                tracing::warn!("Flusher thread exited before shutdown");
            }
        }

        for (domain, result) in self.persistence.flush_dirty() {
            match result {
                Ok(outcome) => tracing::debug!(
                    "Final flush of domain '{}': {} records",
                    domain,
                    outcome.records
                ),
                Err(e) => tracing::error!("Final flush of domain '{}' failed: {}", domain, e),
            }
        }

        if let Some(Workers { flusher, expiry }) = running {
            flusher.shutdown();
            expiry.shutdown();
        }
        self.keyspace.scheduler().clear();

        tracing::info!("Store at {:?} closed", self.config.data_dir);
    }

    // =========================================================================
    // Durability
    // =========================================================================

    /// Flush one domain synchronously; failures reach the caller
    pub fn save_domain_now(&self, domain: &str) -> Result<FlushOutcome> {
        self.ensure_ready()?;
        self.persistence.flush_domain(domain)
    }

    /// Flush every dirty domain synchronously
    ///
    /// Every dirty domain is attempted; the first failure is returned.
    pub fn flush_all(&self) -> Result<Vec<FlushOutcome>> {
        self.ensure_ready()?;
        self.persistence
            .flush_dirty()
            .into_iter()
            .map(|(_, result)| result)
            .collect()
    }

    /// Whether a domain has changes not yet on disk
    pub fn is_dirty(&self, domain: &str) -> bool {
        self.persistence.tracker().is_dirty(domain)
    }

    /// Fire due evictions now; returns how many entries were removed
    pub fn run_expirations(&self) -> Result<usize> {
        self.ensure_ready()?;
        Ok(self.keyspace.run_expirations())
    }

    pub fn stats(&self) -> PersistenceStats {
        self.persistence.stats()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// File backing `domain`
    pub fn domain_path(&self, domain: &str) -> PathBuf {
        self.persistence.domain_path(domain)
    }

    /// Declared domains
    pub fn domains(&self) -> &[DomainSpec] {
        self.persistence.specs()
    }

    /// Domain that stores `key`
    pub fn entry_domain(&self, key: &str) -> &str {
        self.router.entry_domain(key)
    }

    /// Domain that stores stream `name`
    pub fn stream_domain(&self, name: &str) -> &str {
        self.router.stream_domain(name)
    }

    // =========================================================================
    // Entry Table
    // =========================================================================

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_ready()?;
        self.keyspace.get(key)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_ready()?;
        self.keyspace.set(key, value)
    }

    pub fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.ensure_ready()?;
        self.keyspace.set_with_ttl(key, value, ttl)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_ready()?;
        Ok(self.keyspace.delete(key))
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_ready()?;
        Ok(self.keyspace.exists(key))
    }

    pub fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.ensure_ready()?;
        Ok(self.keyspace.ttl(key))
    }

    pub fn persist(&self, key: &str) -> Result<bool> {
        self.ensure_ready()?;
        Ok(self.keyspace.persist(key))
    }

    pub fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_ready()?;
        Ok(self.keyspace.keys(prefix))
    }

    pub fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.ensure_ready()?;
        self.keyspace.hash_set(key, field, value)
    }

    pub fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.ensure_ready()?;
        self.keyspace.hash_get(key, field)
    }

    pub fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.ensure_ready()?;
        self.keyspace.hash_get_all(key)
    }

    pub fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<usize> {
        self.ensure_ready()?;
        self.keyspace.hash_delete(key, fields)
    }

    pub fn set_add(&self, key: &str, members: &[&str]) -> Result<usize> {
        self.ensure_ready()?;
        self.keyspace.set_add(key, members)
    }

    pub fn set_remove(&self, key: &str, members: &[&str]) -> Result<usize> {
        self.ensure_ready()?;
        self.keyspace.set_remove(key, members)
    }

    pub fn is_member(&self, key: &str, member: &str) -> Result<bool> {
        self.ensure_ready()?;
        self.keyspace.is_member(key, member)
    }

    pub fn cardinality(&self, key: &str) -> Result<usize> {
        self.ensure_ready()?;
        self.keyspace.cardinality(key)
    }

    pub fn members(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_ready()?;
        self.keyspace.members(key)
    }

    // =========================================================================
    // Stream Table
    // =========================================================================

    pub fn append(&self, stream: &str, id: &str, fields: &[(&str, &str)]) -> Result<EntryId> {
        self.ensure_ready()?;
        self.streams.append(stream, id, fields)
    }

    pub fn read(
        &self,
        streams: &[(&str, &str)],
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamBatch>> {
        self.ensure_ready()?;
        self.streams.read(streams, count, block)
    }

    pub fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        create_stream_if_missing: bool,
    ) -> Result<()> {
        self.ensure_ready()?;
        self.streams
            .create_group(stream, group, start, create_stream_if_missing)
    }

    pub fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(&str, &str)],
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamBatch>> {
        self.ensure_ready()?;
        self.streams.read_group(group, consumer, streams, count, block)
    }

    pub fn acknowledge(&self, stream: &str, group: &str, ids: &[&str]) -> Result<usize> {
        self.ensure_ready()?;
        self.streams.acknowledge(stream, group, ids)
    }

    pub fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingInfo>> {
        self.ensure_ready()?;
        self.streams.pending(stream, group)
    }

    pub fn last_delivered(&self, stream: &str, group: &str) -> Result<EntryId> {
        self.ensure_ready()?;
        self.streams.last_delivered(stream, group)
    }

    pub fn destroy_group(&self, stream: &str, group: &str) -> Result<bool> {
        self.ensure_ready()?;
        self.streams.destroy_group(stream, group)
    }

    pub fn stream_len(&self, stream: &str) -> Result<usize> {
        self.ensure_ready()?;
        Ok(self.streams.stream_len(stream))
    }

    pub fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> Result<Vec<StreamRecord>> {
        self.ensure_ready()?;
        self.streams.range(stream, start, end, count)
    }

    pub fn stream_exists(&self, stream: &str) -> Result<bool> {
        self.ensure_ready()?;
        Ok(self.streams.exists(stream))
    }

    pub fn stream_names(&self) -> Result<Vec<String>> {
        self.ensure_ready()?;
        Ok(self.streams.names())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(CairnError::NotReady)
        }
    }

    fn populate(&self, loaded: LoadedDomains) -> ConnectReport {
        let mut report = ConnectReport {
            from_backup: loaded.from_backup,
            migrated: loaded.migration.migrated,
            ..ConnectReport::default()
        };

        // Records filed under their routed domain load first; a copy of the
        // same key found in another domain's file never overrides them
        let mut claimed: HashSet<(DomainKind, &str)> = HashSet::new();
        let mut strays = Vec::new();

        for (domain, document) in &loaded.documents {
            let Ok(spec) = self.persistence.spec(domain) else {
                continue;
            };
            for (key, record) in &document.records {
                if self.home_domain(spec.kind, key) != spec.name {
                    strays.push((spec, key.as_str(), record));
                } else if self.restore_record(spec, key, record, &mut report).is_some() {
                    claimed.insert((spec.kind, key.as_str()));
                }
            }
        }

        let tracker = self.persistence.tracker();
        let mut moved: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
        for (spec, key, record) in strays {
            let home = self.home_domain(spec.kind, key);
            tracing::warn!(
                "Domain '{}': key '{}' belongs to domain '{}', moving it",
                spec.name,
                key,
                home
            );

            if claimed.insert((spec.kind, key)) {
                match self.restore_record(spec, key, record, &mut report) {
                    Some(true) => {
                        tracker.mark(home, key);
                        moved.entry(home).or_default().push((spec.name.as_str(), key));
                        report.rehomed += 1;
                        continue;
                    }
                    Some(false) => {}
                    None => {
                        // Undecodable strays stay where they are
                        claimed.remove(&(spec.kind, key));
                        continue;
                    }
                }
            }

            tracker.mark(&spec.name, key);
            report.rehomed += 1;
        }

        // A moved record leaves its old file only once its home file holds it
        for (home, strays) in moved {
            match self.persistence.flush_domain(home) {
                Ok(_) => {
                    for (source, key) in strays {
                        tracker.mark(source, key);
                    }
                }
                Err(e) => tracing::error!(
                    "Domain '{}': could not store moved records, keeping old copies: {}",
                    home,
                    e
                ),
            }
        }

        report
    }

    /// Domain a key of `kind` is routed to
    fn home_domain(&self, kind: DomainKind, key: &str) -> &str {
        match kind {
            DomainKind::Entries => self.router.entry_domain(key),
            DomainKind::Streams => self.router.stream_domain(key),
        }
    }

    /// Load one record into its table
    ///
    /// Returns `Some(true)` when it is live, `Some(false)` when it had
    /// already expired and `None` when it could not be decoded.
    fn restore_record(
        &self,
        spec: &DomainSpec,
        key: &str,
        record: &Json,
        report: &mut ConnectReport,
    ) -> Option<bool> {
        match spec.kind {
            DomainKind::Entries => match decode_entry(record) {
                Some((value, expires_at)) => {
                    let live = self.keyspace.restore(key, value, expires_at);
                    if live {
                        report.entries += 1;
                    } else {
                        report.expired += 1;
                    }
                    Some(live)
                }
                None => {
                    tracing::warn!(
                        "Domain '{}': skipping undecodable entry '{}'",
                        spec.name,
                        key
                    );
                    report.skipped += 1;
                    None
                }
            },
            DomainKind::Streams => match self.streams.restore(key, record) {
                Ok(()) => {
                    report.streams += 1;
                    Some(true)
                }
                Err(e) => {
                    tracing::warn!(
                        "Domain '{}': skipping stream '{}': {}",
                        spec.name,
                        key,
                        e
                    );
                    report.skipped += 1;
                    None
                }
            },
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.quit();
    }
}
