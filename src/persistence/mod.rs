//! Persistence Module
//!
//! Partitions the in-memory state into named domains, each backed by one
//! JSON document on disk.
//!
//! ## Responsibilities
//! - Debounced, coalesced background flushes of dirty domains
//! - Immediate synchronous flushes for durability-critical writes
//! - One-time split of the legacy combined file into domain files
//! - Duplicate resolution and numeric normalization on load
//!
//! ## Flush Path
//! ```text
//!  mutation ──mark(domain, key)──► DirtyTracker ──signal──► FlushWorker
//!                                        │                     │ (debounce)
//!                                        ▼                     ▼
//!                              take touched keys ◄──── flush_domain()
//!                                        │
//!                     snapshot (brief lock) → read file → merge → write
//! ```

mod document;
mod domain;
mod flusher;
mod legacy;
mod manager;
mod resolve;

pub use document::{
    backup_path, decode_records, domain_file_name, domain_file_path, read_document,
    read_with_fallback, temp_path, write_document, DocumentSource, DomainDocument, Records,
};
pub use domain::{DomainKind, DomainRouter, DomainSpec};
pub use flusher::FlushWorker;
pub use legacy::{migrate_legacy, MigrationReport};
pub use manager::{
    DirtyTracker, FlushOutcome, FlushSignal, LoadedDomains, PersistenceManager,
    PersistenceStats, RecordSource,
};
pub use resolve::{
    completeness, normalize_numeric_fields, CompletenessResolver, ConflictResolver,
    PreferFieldResolver, Resolution,
};
