//! KeySpace Module
//!
//! The Entry Table: scalar, hash and set entries under string keys, with
//! optional expiration deadlines.
//!
//! ## Responsibilities
//! - One payload kind per key, enforced on every operation
//! - Cancel-on-rewrite TTL semantics through the [`ExpiryScheduler`]
//! - Mark the owning domain dirty on every mutation
//!
//! ## Data Structure Choice
//! A single `HashMap` behind a `parking_lot::RwLock`: every operation holds
//! the lock for its whole duration, so no caller observes a half-applied
//! mutation. Multi-call sequences are not atomic.

mod expiry;
mod record;
mod table;

use std::collections::{HashMap, HashSet};

pub use expiry::{ExpiryScheduler, ExpiryWorker};
pub use record::{decode_entry, encode_entry};
pub use table::KeySpace;

/// Payload of an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Scalar(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

/// Payload kind, used in type-mismatch errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Scalar,
    Hash,
    Set,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Scalar => "scalar",
            Kind::Hash => "hash",
            Kind::Set => "set",
        }
    }
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Scalar(_) => Kind::Scalar,
            Value::Hash(_) => Kind::Hash,
            Value::Set(_) => Kind::Set,
        }
    }
}

/// An entry as held in the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Value,

    /// Unix millis after which the entry is gone
    pub expires_at: Option<u64>,

    /// Identity of the logical value; changes whenever the key is rewritten
    /// with `set`/`set_with_ttl` or recreated, never on in-place edits
    pub version: u64,
}

impl StoredEntry {
    /// Whether the deadline has passed at `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.map_or(false, |deadline| deadline <= now_ms)
    }
}
