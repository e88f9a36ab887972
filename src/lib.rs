//! # CairnKV
//!
//! An embedded, in-process data store with:
//! - Scalar, hash and set entries with TTL eviction
//! - Append-only streams with consumer groups
//! - Partitioned persistence: one JSON document per domain, debounced
//!   background flushes plus immediate flushes for critical writes
//! - One-time migration from a legacy combined file
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Store Facade                           │
//! │            (connect / ping / quit, NotReady guard)           │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │                              │
//!                ▼                              ▼
//!   ┌────────────────────────┐      ┌────────────────────────┐
//!   │        KeySpace        │      │      StreamTable       │
//!   │ (RwLock, TTL versions) │      │ (Mutex + Condvar)      │
//!   └──────┬─────────┬───────┘      └───────────┬────────────┘
//!          │         │ schedule                 │
//!          │         ▼                          │
//!          │  ┌──────────────┐                  │
//!          │  │ExpiryScheduler│◄── expiry thread │
//!          │  └──────────────┘                  │
//!          │ mark(domain, key)                  │
//!          ▼                                    ▼
//!   ┌─────────────────────────────────────────────────────────────┐
//!   │                       DirtyTracker                           │
//!   └─────────────────────┬───────────────────────────────────────┘
//!                         │ signal
//!                         ▼
//!   ┌─────────────────────────────────────────────────────────────┐
//!   │       PersistenceManager  ◄── flusher thread (debounce)      │
//!   │   <domain>.json  <domain>.json.bak   store.json (legacy)     │
//!   └─────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod config;
pub mod error;

pub mod keyspace;
pub mod persistence;
pub mod stream;

pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigBuilder};
pub use error::{CairnError, Result};
pub use keyspace::Value;
pub use persistence::{DomainKind, DomainSpec, FlushOutcome};
pub use store::{ConnectReport, Store};
pub use stream::{EntryId, StreamBatch, StreamRecord};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of CairnKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
