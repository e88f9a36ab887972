//! Stream entry identifiers
//!
//! An [`EntryId`] is `(milliseconds, sequence)`, written `ms-seq`. Ordering
//! is lexicographic on the pair, so two records appended in the same
//! millisecond still order by sequence.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CairnError, Result};

/// Identifier of one stream record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// `0-0`, smaller than every valid record id
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    /// Largest representable id
    pub const MAX: EntryId = EntryId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id greater than this one (`None` past [`EntryId::MAX`])
    pub fn successor(self) -> Option<Self> {
        match self.seq.checked_add(1) {
            Some(seq) => Some(Self::new(self.ms, seq)),
            None => Some(Self::new(self.ms.checked_add(1)?, 0)),
        }
    }

    /// Parse `ms-seq` or a bare `ms` (sequence 0)
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || CairnError::InvalidStreamId(raw.to_string());

        let (ms, seq) = match raw.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (raw, "0"),
        };
        let ms = ms.parse::<u64>().map_err(|_| invalid())?;
        let seq = seq.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self { ms, seq })
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        EntryId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Where a plain (non-group) read starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// `$`: only records appended after the call started
    Tail,

    /// Records strictly after this id (`0` reads from the beginning)
    After(EntryId),
}

impl ReadFrom {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "$" => Ok(ReadFrom::Tail),
            ">" => Err(CairnError::InvalidStreamId(
                "'>' is only valid for consumer group reads".to_string(),
            )),
            other => Ok(ReadFrom::After(EntryId::parse(other)?)),
        }
    }
}

/// Where a consumer group read starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupReadFrom {
    /// `>`: records never delivered to the group
    Undelivered,

    /// The consumer's own pending records after this id
    PendingAfter(EntryId),
}

impl GroupReadFrom {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            ">" => Ok(GroupReadFrom::Undelivered),
            other => Ok(GroupReadFrom::PendingAfter(EntryId::parse(other)?)),
        }
    }
}

/// Bound of a range query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeBound {
    Min,
    Max,
    Id(EntryId),
}

impl RangeBound {
    pub(crate) fn parse(raw: &str) -> Result<Self> {
        match raw {
            "-" => Ok(RangeBound::Min),
            "+" => Ok(RangeBound::Max),
            other => Ok(RangeBound::Id(EntryId::parse(other)?)),
        }
    }

    pub(crate) fn resolve(self) -> EntryId {
        match self {
            RangeBound::Min => EntryId::ZERO,
            RangeBound::Max => EntryId::MAX,
            RangeBound::Id(id) => id,
        }
    }
}
