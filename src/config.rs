//! Configuration for CairnKV
//!
//! Centralized configuration with sensible defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{CairnError, Result};
use crate::persistence::{backup_path, domain_file_name, temp_path, DomainKind, DomainSpec};

/// Name of the default domain for scalar/hash/set entries
pub const DEFAULT_ENTRY_DOMAIN: &str = "keyspace";

/// Name of the default domain for stream snapshots
pub const DEFAULT_STREAM_DOMAIN: &str = "streams";

/// Main configuration for a CairnKV store
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all domain files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── {domain}.json      (one document per domain)
    ///     ├── {domain}.json.bak  (previous version, kept across renames)
    ///     └── store.json         (legacy combined file, read-only)
    pub data_dir: PathBuf,

    /// File name of the legacy combined document inside `data_dir`
    pub legacy_file: String,

    /// Domain partitions, each mapped to one file
    pub domains: Vec<DomainSpec>,

    /// fsync every domain file write before renaming it into place
    pub sync_writes: bool,

    // -------------------------------------------------------------------------
    // Flush Configuration
    // -------------------------------------------------------------------------
    /// Quiet period after the last mutation before a debounced flush runs
    pub flush_delay: Duration,

    /// Upper bound on how long continuous activity can postpone a flush
    pub max_flush_delay: Duration,

    /// How long a durability-critical flush waits for the domain's flush lock
    pub flush_lock_timeout: Duration,

    // -------------------------------------------------------------------------
    // Timer Configuration
    // -------------------------------------------------------------------------
    /// Ceiling for blocking stream reads
    pub max_block: Duration,

    /// Longest the expiration worker sleeps between checks
    pub expiry_poll: Duration,

    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./cairnkv_data"),
            legacy_file: "store.json".to_string(),
            domains: vec![
                DomainSpec::new(DEFAULT_ENTRY_DOMAIN, DomainKind::Entries),
                DomainSpec::new(DEFAULT_STREAM_DOMAIN, DomainKind::Streams),
            ],
            sync_writes: true,
            flush_delay: Duration::from_millis(1000),
            max_flush_delay: Duration::from_secs(5),
            flush_lock_timeout: Duration::from_secs(5),
            max_block: Duration::from_secs(30),
            expiry_poll: Duration::from_secs(1),
            clock: Arc::new(SystemClock),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Path of the legacy combined file
    pub fn legacy_path(&self) -> PathBuf {
        self.data_dir.join(&self.legacy_file)
    }

    /// Check domain names are unique and both default domains exist
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in &self.domains {
            if spec.name.is_empty() {
                return Err(CairnError::Config("domain name must not be empty".into()));
            }
            if spec.name.contains(|c: char| c == '/' || c == '\\') {
                return Err(CairnError::Config(format!(
                    "domain name '{}' must not contain a path separator",
                    spec.name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(CairnError::Config(format!(
                    "duplicate domain name '{}'",
                    spec.name
                )));
            }

            // The legacy file is read-only; no domain may write over it
            let file = PathBuf::from(domain_file_name(&spec.name));
            let legacy = Path::new(&self.legacy_file);
            if [backup_path(&file), temp_path(&file), file].iter().any(|p| p == legacy) {
                return Err(CairnError::Config(format!(
                    "domain '{}' would overwrite the legacy file '{}'",
                    spec.name, self.legacy_file
                )));
            }
        }

        for (name, kind) in [
            (DEFAULT_ENTRY_DOMAIN, DomainKind::Entries),
            (DEFAULT_STREAM_DOMAIN, DomainKind::Streams),
        ] {
            match self.domains.iter().find(|d| d.name == name) {
                Some(spec) if spec.kind == kind => {}
                Some(_) => {
                    return Err(CairnError::Config(format!(
                        "default domain '{}' must be of kind {:?}",
                        name, kind
                    )))
                }
                None => {
                    return Err(CairnError::Config(format!(
                        "missing default domain '{}'",
                        name
                    )))
                }
            }
        }

        if self.flush_delay > self.max_flush_delay {
            return Err(CairnError::Config(
                "flush_delay must not exceed max_flush_delay".into(),
            ));
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all domain files)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the legacy combined file name
    pub fn legacy_file(mut self, name: impl Into<String>) -> Self {
        self.config.legacy_file = name.into();
        self
    }

    /// Add a domain, replacing any existing domain with the same name
    pub fn domain(mut self, spec: DomainSpec) -> Self {
        self.config.domains.retain(|d| d.name != spec.name);
        self.config.domains.push(spec);
        self
    }

    /// Enable or disable fsync on domain file writes
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.config.sync_writes = enabled;
        self
    }

    /// Set the debounce delay
    pub fn flush_delay(mut self, delay: Duration) -> Self {
        self.config.flush_delay = delay;
        self
    }

    /// Set the longest a flush may be postponed by continuous activity
    pub fn max_flush_delay(mut self, delay: Duration) -> Self {
        self.config.max_flush_delay = delay;
        self
    }

    /// Set the flush lock timeout for immediate saves
    pub fn flush_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.flush_lock_timeout = timeout;
        self
    }

    /// Set the ceiling for blocking reads
    pub fn max_block(mut self, ceiling: Duration) -> Self {
        self.config.max_block = ceiling;
        self
    }

    /// Set the expiration worker's maximum sleep
    pub fn expiry_poll(mut self, poll: Duration) -> Self {
        self.config.expiry_poll = poll;
        self
    }

    /// Set the time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.config.clock = clock;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
