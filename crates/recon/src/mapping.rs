//! Mapping store: the persistent record of every source row a migration has
//! written, and where it went.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ReconError;
use crate::identity::{DestinationId, IdentityKey, IdentityValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Imported,
    NeedsUpdate,
    Ignored,
    Failed,
}

impl MappingStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Imported => 0,
            Self::NeedsUpdate => 1,
            Self::Ignored => 2,
            Self::Failed => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Imported),
            1 => Some(Self::NeedsUpdate),
            2 => Some(Self::Ignored),
            3 => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Imported => write!(f, "imported"),
            Self::NeedsUpdate => write!(f, "needs_update"),
            Self::Ignored => write!(f, "ignored"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub source_key: IdentityKey,
    #[serde(default)]
    pub destination: Option<DestinationId>,
    pub status: MappingStatus,
    /// Digest of the source row last written, for change tracking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Cursor-style mapping store, one per migration.
///
/// Iteration order is the store's natural order (insertion order for the
/// bundled stores). Records are only ever removed by `destroy`.
pub trait MappingStore {
    /// Position the cursor on the first record.
    fn rewind(&mut self) -> Result<(), ReconError>;

    /// Record under the cursor, `None` once exhausted.
    fn current(&self) -> Option<&MappingRecord>;

    fn has_current(&self) -> bool {
        self.current().is_some()
    }

    fn current_identity_key(&self) -> Option<&IdentityKey> {
        self.current().map(|r| &r.source_key)
    }

    fn advance(&mut self);

    /// Destination id recorded for `key`, scalar or composite.
    fn resolve_destination_id(&self, key: &IdentityKey) -> Result<Option<DestinationId>, ReconError>;

    fn lookup(&self, key: &IdentityKey) -> Result<Option<MappingRecord>, ReconError>;

    /// Insert or update the record for `record.source_key`. Updates keep the
    /// record's position in iteration order.
    fn save_mapping(&mut self, record: MappingRecord) -> Result<(), ReconError>;

    /// Find the record whose destination matches every field present in
    /// `values` (keyed by destination id field name). Fields not present are
    /// ignored; with no usable field nothing matches.
    fn row_by_destination(
        &self,
        values: &BTreeMap<String, IdentityValue>,
    ) -> Result<Option<MappingRecord>, ReconError>;

    fn len(&self) -> Result<usize, ReconError>;

    fn is_empty(&self) -> Result<bool, ReconError> {
        Ok(self.len()? == 0)
    }

    /// Wipe every record for this migration.
    fn destroy(&mut self) -> Result<(), ReconError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMappingStore {
    /// Destination id field names, in the order of composite components.
    pub destination_fields: Vec<String>,
    records: Vec<MappingRecord>,
    #[serde(skip)]
    cursor: usize,
}

impl MemoryMappingStore {
    pub fn new(destination_fields: Vec<String>) -> Self {
        Self {
            destination_fields,
            records: Vec::new(),
            cursor: 0,
        }
    }

    pub fn records(&self) -> &[MappingRecord] {
        &self.records
    }

    fn position(&self, key: &IdentityKey) -> Option<usize> {
        self.records.iter().position(|r| &r.source_key == key)
    }
}

impl MappingStore for MemoryMappingStore {
    fn rewind(&mut self) -> Result<(), ReconError> {
        self.cursor = 0;
        Ok(())
    }

    fn current(&self) -> Option<&MappingRecord> {
        self.records.get(self.cursor)
    }

    fn advance(&mut self) {
        if self.cursor < self.records.len() {
            self.cursor += 1;
        }
    }

    fn resolve_destination_id(&self, key: &IdentityKey) -> Result<Option<DestinationId>, ReconError> {
        Ok(self.position(key).and_then(|i| self.records[i].destination.clone()))
    }

    fn lookup(&self, key: &IdentityKey) -> Result<Option<MappingRecord>, ReconError> {
        Ok(self.position(key).map(|i| self.records[i].clone()))
    }

    fn save_mapping(&mut self, record: MappingRecord) -> Result<(), ReconError> {
        match self.position(&record.source_key) {
            Some(i) => self.records[i] = record,
            None => self.records.push(record),
        }
        Ok(())
    }

    fn row_by_destination(
        &self,
        values: &BTreeMap<String, IdentityValue>,
    ) -> Result<Option<MappingRecord>, ReconError> {
        let conditions: Vec<(usize, &IdentityValue)> = self
            .destination_fields
            .iter()
            .enumerate()
            .filter_map(|(i, field)| values.get(field).map(|v| (i, v)))
            .collect();
        if conditions.is_empty() {
            return Ok(None);
        }

        Ok(self
            .records
            .iter()
            .find(|r| {
                let Some(dest) = &r.destination else { return false };
                let parts = dest.components();
                conditions.iter().all(|(i, v)| parts.get(*i) == Some(*v))
            })
            .cloned())
    }

    fn len(&self) -> Result<usize, ReconError> {
        Ok(self.records.len())
    }

    fn destroy(&mut self) -> Result<(), ReconError> {
        self.records.clear();
        self.cursor = 0;
        Ok(())
    }
}
