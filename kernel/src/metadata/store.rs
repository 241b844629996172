// Metadata Store
//
// Holds exactly one versioned instance per metadata type. The store
// itself is immutable after construction; all mutation goes through
// the instances, which are individually synchronized.

use std::sync::Arc;

use super::{ChangeInfo, Metadata, MetadataType, SequenceNumber};

/// Per-node registry of metadata instances.
#[derive(Debug)]
pub struct MetadataStore {
    instances: [Arc<Metadata>; 3],
}

impl MetadataStore {
    /// Create an empty store whose instances retain at most
    /// `history_limit` deltas each (`None` keeps everything).
    pub fn new(history_limit: Option<usize>) -> Self {
        Self {
            instances: MetadataType::ALL.map(|metadata_type| {
                Arc::new(Metadata::with_history_limit(metadata_type, history_limit))
            }),
        }
    }

    /// The instance holding metadata of the given type.
    pub fn get(&self, metadata_type: MetadataType) -> &Arc<Metadata> {
        &self.instances[metadata_type.ordinal()]
    }

    pub fn apply_change(
        &self,
        metadata_type: MetadataType,
        payload: impl Into<Vec<u8>>,
    ) -> SequenceNumber {
        self.get(metadata_type).apply_change(payload)
    }

    pub fn sequence_number(&self, metadata_type: MetadataType) -> SequenceNumber {
        self.get(metadata_type).sequence_number()
    }

    pub fn change_info(&self, metadata_type: MetadataType, start: SequenceNumber) -> ChangeInfo {
        self.get(metadata_type).change_info(start)
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new(None)
    }
}
