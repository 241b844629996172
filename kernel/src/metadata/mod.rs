// Versioned Metadata
//
// Every metadata instance carries a monotonically increasing sequence
// number and an in-memory change log from which incremental deltas are
// served to nodes that need to catch up.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub mod replica;
pub mod store;

pub use replica::{MetadataReplica, SyncError, SyncOutcome};
pub use store::MetadataStore;

/// Position of a metadata instance in its history.
pub type SequenceNumber = i64;

/// Sequence number of a copy whose position is not yet known.
pub const UNKNOWN_SEQ_NUM: SequenceNumber = -1;

/// Sequence number of a freshly created instance.
pub const EMPTY_SEQUENCE_NUMBER: SequenceNumber = 0;

/// Kind of metadata held by the store.
///
/// Ordinals are part of the wire format: append new variants, never
/// reorder or remove existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetadataType {
    #[serde(rename = "Topology")]
    Topology = 0,
    #[serde(rename = "Table")]
    Table = 1,
    #[serde(rename = "Security")]
    Security = 2,
}

/// Storage keys, indexed by ordinal.
const TYPE_KEYS: [(MetadataType, &str); 3] = [
    (MetadataType::Topology, "Topology"),
    (MetadataType::Table, "Table"),
    (MetadataType::Security, "Security"),
];

impl MetadataType {
    pub const ALL: [MetadataType; 3] = [
        MetadataType::Topology,
        MetadataType::Table,
        MetadataType::Security,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Stable string key used to index this type in storage.
    pub fn key(self) -> &'static str {
        TYPE_KEYS[self.ordinal()].1
    }

    pub fn from_key(key: &str) -> Option<Self> {
        TYPE_KEYS
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(metadata_type, _)| *metadata_type)
    }
}

impl fmt::Display for MetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown metadata type: {0}")]
pub struct UnknownMetadataType(pub String);

impl FromStr for MetadataType {
    type Err = UnknownMetadataType;

    /// Accepts the storage key in any case, e.g. `topology` or `Topology`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TYPE_KEYS
            .iter()
            .find(|(_, k)| k.eq_ignore_ascii_case(s))
            .map(|(metadata_type, _)| *metadata_type)
            .ok_or_else(|| UnknownMetadataType(s.to_string()))
    }
}

/// A single delta in a metadata instance's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataChange {
    /// Sequence number the instance reached by applying this change.
    pub sequence_number: SequenceNumber,
    pub payload: Vec<u8>,
}

/// Incremental change set served to a copy that is behind.
///
/// An empty change set is a valid answer: it means either that the copy
/// is current, or that the requested range is no longer reconstructable
/// and the caller should fall back to a full resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub metadata_type: MetadataType,
    /// Sequence number the changes apply on top of.
    pub from: SequenceNumber,
    /// Sequence number reached after applying every change.
    pub to: SequenceNumber,
    pub changes: Vec<MetadataChange>,
}

impl ChangeInfo {
    pub fn empty(metadata_type: MetadataType) -> Self {
        Self {
            metadata_type,
            from: UNKNOWN_SEQ_NUM,
            to: UNKNOWN_SEQ_NUM,
            changes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn first_sequence_number(&self) -> Option<SequenceNumber> {
        self.changes.first().map(|c| c.sequence_number)
    }

    pub fn last_sequence_number(&self) -> Option<SequenceNumber> {
        self.changes.last().map(|c| c.sequence_number)
    }
}

#[derive(Debug)]
struct ChangeLog {
    sequence_number: SequenceNumber,
    changes: VecDeque<MetadataChange>,
}

/// One versioned metadata instance.
///
/// Writers append under an exclusive lock, so the sequence number and
/// the delta that produced it always become visible together.
#[derive(Debug)]
pub struct Metadata {
    metadata_type: MetadataType,
    history_limit: Option<usize>,
    log: RwLock<ChangeLog>,
}

impl Metadata {
    /// Create an instance at [`EMPTY_SEQUENCE_NUMBER`] that retains its
    /// whole history.
    pub fn new(metadata_type: MetadataType) -> Self {
        Self::with_history_limit(metadata_type, None)
    }

    /// Create an instance that retains at most `limit` deltas; older
    /// ones are discarded as new ones arrive.
    pub fn with_history_limit(metadata_type: MetadataType, limit: Option<usize>) -> Self {
        Self {
            metadata_type,
            history_limit: limit,
            log: RwLock::new(ChangeLog {
                sequence_number: EMPTY_SEQUENCE_NUMBER,
                changes: VecDeque::new(),
            }),
        }
    }

    pub fn metadata_type(&self) -> MetadataType {
        self.metadata_type
    }

    /// Append a delta and bump the sequence number by one.
    pub fn apply_change(&self, payload: impl Into<Vec<u8>>) -> SequenceNumber {
        let mut log = self.log.write();
        let next = log.sequence_number + 1;

        log.changes.push_back(MetadataChange {
            sequence_number: next,
            payload: payload.into(),
        });
        if let Some(limit) = self.history_limit {
            while log.changes.len() > limit {
                log.changes.pop_front();
            }
        }
        log.sequence_number = next;

        tracing::debug!(metadata = %self.metadata_type, seq = next, "applied metadata change");
        next
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.log.read().sequence_number
    }

    /// Oldest sequence number still retrievable as a delta.
    pub fn oldest_retained(&self) -> Option<SequenceNumber> {
        self.log.read().changes.front().map(|c| c.sequence_number)
    }

    /// Changes a copy at `start` needs to become current.
    ///
    /// Returns an empty change set when `start` is below
    /// [`EMPTY_SEQUENCE_NUMBER`], at or beyond the current sequence
    /// number, or older than the retained history.
    pub fn change_info(&self, start: SequenceNumber) -> ChangeInfo {
        let log = self.log.read();

        if start < EMPTY_SEQUENCE_NUMBER || start >= log.sequence_number {
            return ChangeInfo::empty(self.metadata_type);
        }

        let oldest = match log.changes.front() {
            Some(first) => first.sequence_number,
            None => return ChangeInfo::empty(self.metadata_type),
        };
        // The change producing `start + 1` must still be retained.
        if oldest > start + 1 {
            return ChangeInfo::empty(self.metadata_type);
        }

        let skip = usize::try_from(start + 1 - oldest).unwrap_or(0);
        ChangeInfo {
            metadata_type: self.metadata_type,
            from: start,
            to: log.sequence_number,
            changes: log.changes.iter().skip(skip).cloned().collect(),
        }
    }
}
