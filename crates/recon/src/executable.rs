//! Row-by-row import: the reference `Migration` implementation that copies
//! source columns into destination entities and records the mapping.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::entity::{DestinationStorage, Entity};
use crate::error::ReconError;
use crate::identity::{DestinationId, IdentityKey};
use crate::mapping::{MappingRecord, MappingStatus, MappingStore};
use crate::migration::{Collaborators, ImportCounts, ImportResult, Migration, MigrationStatus};
use crate::source::{SourceProvider, SourceRow};

pub struct RowMigration {
    id: String,
    label: String,
    id_fields: Vec<String>,
    dependencies: Vec<String>,
    orphan_action: String,
    /// destination field ← source column
    process: BTreeMap<String, String>,
    track_changes: bool,
    status: MigrationStatus,
    interruption: Option<ImportResult>,
    source: Box<dyn SourceProvider>,
    mapping: Box<dyn MappingStore>,
    storage: Box<dyn DestinationStorage>,
    rows: Vec<SourceRow>,
    cursor: usize,
}

impl RowMigration {
    pub fn new(
        id: &str,
        id_fields: Vec<String>,
        source: Box<dyn SourceProvider>,
        mapping: Box<dyn MappingStore>,
        storage: Box<dyn DestinationStorage>,
    ) -> Self {
        Self {
            id: id.to_string(),
            label: id.to_string(),
            id_fields,
            dependencies: Vec::new(),
            orphan_action: String::new(),
            process: BTreeMap::new(),
            track_changes: true,
            status: MigrationStatus::Idle,
            interruption: None,
            source,
            mapping,
            storage,
            rows: Vec::new(),
            cursor: 0,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_orphan_action(mut self, action: &str) -> Self {
        self.orphan_action = action.to_string();
        self
    }

    /// Destination field ← source column. With an empty map every source
    /// column is copied as-is.
    pub fn with_process(mut self, process: BTreeMap<String, String>) -> Self {
        self.process = process;
        self
    }

    pub fn with_track_changes(mut self, track: bool) -> Self {
        self.track_changes = track;
        self
    }

    pub fn interruption(&self) -> Option<ImportResult> {
        self.interruption
    }

    pub fn mapping(&self) -> &dyn MappingStore {
        self.mapping.as_ref()
    }

    pub fn storage(&self) -> &dyn DestinationStorage {
        self.storage.as_ref()
    }

    fn build_fields(&self, row: &SourceRow) -> BTreeMap<String, Value> {
        if self.process.is_empty() {
            return row.clone();
        }
        self.process
            .iter()
            .filter_map(|(dest, src)| row.get(src).map(|v| (dest.clone(), v.clone())))
            .collect()
    }

    /// Import one row. `Ok(None)` means the row was unchanged and skipped.
    fn import_row(&mut self, key: IdentityKey, row: &SourceRow) -> Result<Option<bool>, ReconError> {
        let hash = row_hash(row);
        let existing = self.mapping.lookup(&key)?;

        if self.track_changes {
            if let Some(record) = &existing {
                if record.status == MappingStatus::Imported && record.hash.as_deref() == Some(hash.as_str()) {
                    return Ok(None);
                }
            }
        }

        let fields = self.build_fields(row);
        let loaded = match existing.and_then(|r| r.destination).and_then(|d| d.into_scalar()) {
            Some(id) => self.storage.load(&id)?,
            None => None,
        };

        let (mut entity, created) = match loaded {
            Some(mut entity) => {
                for (name, value) in fields {
                    entity.set(&name, value);
                }
                (entity, false)
            }
            None => (Entity::new(fields), true),
        };
        self.storage.save(&mut entity)?;

        let destination = entity.id.clone().map(DestinationId::Scalar);
        self.mapping.save_mapping(MappingRecord {
            source_key: key,
            destination,
            status: MappingStatus::Imported,
            hash: Some(hash),
        })?;
        Ok(Some(created))
    }
}

/// SHA-256 over the row's canonical JSON (keys sorted).
pub fn row_hash(row: &SourceRow) -> String {
    let canonical = serde_json::to_string(row).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl Migration for RowMigration {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn status(&self) -> MigrationStatus {
        self.status
    }

    fn set_status(&mut self, status: MigrationStatus) {
        self.status = status;
    }

    fn interrupt(&mut self, result: ImportResult) {
        self.interruption = Some(result);
        self.status = MigrationStatus::Stopping;
    }

    fn required_dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn orphan_action(&self) -> &str {
        &self.orphan_action
    }

    fn source_count(&mut self) -> Result<usize, ReconError> {
        self.source.count()
    }

    fn start_run(&mut self) -> Result<(), ReconError> {
        self.rows = self.source.rows()?;
        self.cursor = 0;
        Ok(())
    }

    fn import(&mut self, limit: usize) -> (ImportResult, ImportCounts) {
        let mut counts = ImportCounts::default();
        if self.status != MigrationStatus::Idle {
            log::error!("migration '{}' is busy with another operation: {}", self.id, self.status);
            return (ImportResult::Failed, counts);
        }
        self.interruption = None;
        self.status = MigrationStatus::Importing;

        let rows = std::mem::take(&mut self.rows);
        while self.cursor < rows.len() && counts.processed < limit {
            let row = &rows[self.cursor];
            self.cursor += 1;
            counts.processed += 1;

            let Some(key) = IdentityKey::from_row(row, &self.id_fields) else {
                log::warn!("migration '{}': row {} has no complete id, skipped", self.id, self.cursor);
                counts.failed += 1;
                continue;
            };

            match self.import_row(key.clone(), row) {
                Ok(Some(true)) => counts.created += 1,
                Ok(Some(false)) => counts.updated += 1,
                Ok(None) => counts.ignored += 1,
                Err(e) => {
                    log::error!("migration '{}': row {key} failed: {e}", self.id);
                    counts.failed += 1;
                }
            }
        }
        let exhausted = self.cursor >= rows.len();
        self.rows = rows;
        self.status = MigrationStatus::Idle;

        let result = if exhausted {
            ImportResult::Completed
        } else {
            ImportResult::Incomplete
        };
        (result, counts)
    }

    fn collaborators(&mut self) -> Collaborators<'_> {
        Collaborators {
            source: self.source.as_mut(),
            mapping: self.mapping.as_mut(),
            storage: self.storage.as_mut(),
        }
    }
}
