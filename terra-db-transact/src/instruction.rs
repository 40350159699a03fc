//! Write instructions.

use terra_db_core::{CollectionId, Feature, Guid, MapId};

/// Requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    /// Insert a new feature; fails if a head exists
    Create,
    /// Replace the head; fails if none exists
    Update,
    /// Create or update
    Upsert,
    /// Move the head to the deleted shadow (and history)
    Delete,
    /// Delete and also remove the deleted shadow
    Purge,
}

impl WriteOp {
    pub fn needs_feature(self) -> bool {
        matches!(self, WriteOp::Create | WriteOp::Update | WriteOp::Upsert)
    }
}

/// One element of a write batch.
#[derive(Debug, Clone)]
pub struct WriteInstruction {
    pub op: WriteOp,
    pub map: MapId,
    pub collection: CollectionId,
    pub feature_id: String,
    /// New payload for create/update/upsert
    pub feature: Option<Feature>,
    /// Version the client based its change on
    pub expected_guid: Option<Guid>,
}

impl WriteInstruction {
    fn with_feature(op: WriteOp, map: &MapId, collection: &CollectionId, feature: Feature) -> Self {
        Self {
            op,
            map: map.clone(),
            collection: collection.clone(),
            feature_id: feature.id.clone(),
            feature: Some(feature),
            expected_guid: None,
        }
    }

    fn by_id(op: WriteOp, map: &MapId, collection: &CollectionId, feature_id: impl Into<String>) -> Self {
        Self {
            op,
            map: map.clone(),
            collection: collection.clone(),
            feature_id: feature_id.into(),
            feature: None,
            expected_guid: None,
        }
    }

    pub fn create(map: &MapId, collection: &CollectionId, feature: Feature) -> Self {
        Self::with_feature(WriteOp::Create, map, collection, feature)
    }

    pub fn update(map: &MapId, collection: &CollectionId, feature: Feature) -> Self {
        Self::with_feature(WriteOp::Update, map, collection, feature)
    }

    pub fn upsert(map: &MapId, collection: &CollectionId, feature: Feature) -> Self {
        Self::with_feature(WriteOp::Upsert, map, collection, feature)
    }

    pub fn delete(map: &MapId, collection: &CollectionId, feature_id: impl Into<String>) -> Self {
        Self::by_id(WriteOp::Delete, map, collection, feature_id)
    }

    pub fn purge(map: &MapId, collection: &CollectionId, feature_id: impl Into<String>) -> Self {
        Self::by_id(WriteOp::Purge, map, collection, feature_id)
    }

    /// Make the write conditional on the current state being `guid`.
    pub fn with_expected_guid(mut self, guid: Guid) -> Self {
        self.expected_guid = Some(guid);
        self
    }
}

/// Batch-level options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Compose result tuples; when off only outcomes and guids are reported
    pub return_results: bool,
    /// Instructions may be processed in any order
    pub allow_reorder: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            return_results: true,
            allow_reorder: false,
        }
    }
}

impl WriteOptions {
    pub fn without_results(mut self) -> Self {
        self.return_results = false;
        self
    }

    pub fn with_reorder(mut self, allow: bool) -> Self {
        self.allow_reorder = allow;
        self
    }
}
