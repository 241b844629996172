// Metadata Replica
//
// Pull-side consumer of change sets. A replica tracks how far it has
// caught up with a source instance and applies deltas strictly in
// sequence, detecting gaps the same way the source enforces them.

use super::{ChangeInfo, Metadata, MetadataChange, MetadataType, SequenceNumber, UNKNOWN_SEQ_NUM};

/// Result of a single resynchronization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The replica already matches the source.
    UpToDate,

    /// Deltas were applied, moving the replica from `from` to `to`.
    Advanced { from: SequenceNumber, to: SequenceNumber },

    /// The source cannot serve the missing range incrementally. The
    /// caller must copy the full metadata and [`MetadataReplica::reset`].
    NeedsFullResync {
        local: SequenceNumber,
        source: SequenceNumber,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("version conflict: expected {expected}, got {actual}")]
    VersionConflict {
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    #[error("change set for {actual} applied to a {expected} replica")]
    TypeMismatch {
        expected: MetadataType,
        actual: MetadataType,
    },
}

#[derive(Debug)]
pub struct MetadataReplica {
    metadata_type: MetadataType,
    sequence_number: SequenceNumber,
    applied: Vec<MetadataChange>,
}

impl MetadataReplica {
    /// A replica that does not yet know its position.
    pub fn new(metadata_type: MetadataType) -> Self {
        Self::seeded(metadata_type, UNKNOWN_SEQ_NUM)
    }

    pub fn seeded(metadata_type: MetadataType, sequence_number: SequenceNumber) -> Self {
        Self {
            metadata_type,
            sequence_number,
            applied: Vec::new(),
        }
    }

    /// Reposition after an out-of-band full copy.
    pub fn reset(&mut self, sequence_number: SequenceNumber) {
        self.sequence_number = sequence_number;
        self.applied.clear();
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// Deltas applied since construction or the last reset.
    pub fn applied(&self) -> &[MetadataChange] {
        &self.applied
    }

    /// Apply a change set on top of the current position.
    pub fn apply(&mut self, info: &ChangeInfo) -> Result<SyncOutcome, SyncError> {
        if info.metadata_type != self.metadata_type {
            return Err(SyncError::TypeMismatch {
                expected: self.metadata_type,
                actual: info.metadata_type,
            });
        }
        if info.is_empty() {
            return Ok(SyncOutcome::UpToDate);
        }

        let mut expected = self.sequence_number + 1;
        for change in &info.changes {
            if change.sequence_number != expected {
                return Err(SyncError::VersionConflict {
                    expected,
                    actual: change.sequence_number,
                });
            }
            expected += 1;
        }

        let from = self.sequence_number;
        self.applied.extend(info.changes.iter().cloned());
        self.sequence_number = expected - 1;

        Ok(SyncOutcome::Advanced {
            from,
            to: self.sequence_number,
        })
    }

    /// Pull whatever the source has beyond this replica's position.
    pub fn sync_from(&mut self, source: &Metadata) -> Result<SyncOutcome, SyncError> {
        let info = source.change_info(self.sequence_number);
        if !info.is_empty() {
            return self.apply(&info);
        }

        let source_seq = source.sequence_number();
        if self.sequence_number == source_seq {
            return Ok(SyncOutcome::UpToDate);
        }

        // The source may have moved on between the two reads.
        let retry = source.change_info(self.sequence_number);
        if !retry.is_empty() {
            return self.apply(&retry);
        }

        tracing::info!(
            metadata = %self.metadata_type,
            local = self.sequence_number,
            source = source_seq,
            "incremental resync unavailable"
        );
        Ok(SyncOutcome::NeedsFullResync {
            local: self.sequence_number,
            source: source_seq,
        })
    }
}
