//! State directory: mapping tables, the run-guard cache and destination
//! content, plus construction of runnable migrations from the manifest.
//!
//! Layout:
//!
//! ```text
//! <state>/maps.sqlite          migrate_map_<id> tables
//! <state>/state.sqlite         cache_reconcile (run guard)
//! <state>/content/<id>.json    destination entities per migration
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use migrate_config::{Manifest, MigrationConfig, Settings};
use migrate_recon::entity::{DestinationStorage, Entity, EntityType, MemoryStorage};
use migrate_recon::guard::SystemClock;
use migrate_recon::{
    CsvSource, IdentityKey, IdentityValue, MappingStatus, MappingStore, MemoryRegistry, ReconError, Reconciler,
    RowMigration, RunGuard, SqlGuardCache, SqlMappingStore,
};

// ============================================================================
// Destination content
// ============================================================================

/// Destination storage persisted as one JSON file, written through on every
/// save and delete.
pub struct JsonFileStorage {
    path: PathBuf,
    inner: MemoryStorage,
}

impl JsonFileStorage {
    pub fn open(path: PathBuf, entity_type: EntityType) -> Result<Self, ReconError> {
        let inner = match fs::read_to_string(&path) {
            Ok(contents) => {
                let mut stored: MemoryStorage = serde_json::from_str(&contents).map_err(|e| ReconError::Storage {
                    entity_type: entity_type.id.clone(),
                    message: format!("{}: {e}", path.display()),
                })?;
                stored.set_entity_type(entity_type);
                stored
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => MemoryStorage::new(entity_type),
            Err(e) => return Err(ReconError::Io(format!("{}: {e}", path.display()))),
        };
        Ok(Self { path, inner })
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.inner.entities()
    }

    fn flush(&self) -> Result<(), ReconError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ReconError::Io(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&self.inner).map_err(|e| ReconError::Storage {
            entity_type: self.inner.entity_type().id.clone(),
            message: e.to_string(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| ReconError::Io(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| ReconError::Io(format!("{}: {e}", self.path.display())))
    }
}

impl DestinationStorage for JsonFileStorage {
    fn entity_type(&self) -> &EntityType {
        self.inner.entity_type()
    }

    fn load(&self, id: &IdentityValue) -> Result<Option<Entity>, ReconError> {
        self.inner.load(id)
    }

    fn save(&mut self, entity: &mut Entity) -> Result<(), ReconError> {
        self.inner.save(entity)?;
        self.flush()
    }

    fn delete(&mut self, entity: Entity) -> Result<(), ReconError> {
        self.inner.delete(entity)?;
        self.flush()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

// ============================================================================
// Workspace
// ============================================================================

/// Which migration imported a destination entity.
#[derive(Debug, Clone, Serialize)]
pub struct Ownership {
    pub migration: String,
    pub label: String,
    pub source_key: IdentityKey,
    pub status: MappingStatus,
}

pub struct Workspace {
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub settings: Settings,
}

impl Workspace {
    /// Open (creating if needed) the state directory.
    pub fn open(dir: PathBuf, manifest: Manifest, settings: Settings) -> Result<Self, ReconError> {
        fs::create_dir_all(&dir).map_err(|e| ReconError::Io(format!("{}: {e}", dir.display())))?;
        Ok(Self { dir, manifest, settings })
    }

    pub fn maps_path(&self) -> PathBuf {
        self.dir.join("maps.sqlite")
    }

    pub fn guard_path(&self) -> PathBuf {
        self.dir.join("state.sqlite")
    }

    pub fn content_path(&self, migration_id: &str) -> PathBuf {
        self.dir.join("content").join(format!("{migration_id}.json"))
    }

    /// An enabled migration's configuration.
    pub fn config(&self, id: &str) -> Result<&MigrationConfig, ReconError> {
        match self.manifest.get(id) {
            Some(cfg) if cfg.status => Ok(cfg),
            _ => Err(ReconError::UnknownMigration(id.to_string())),
        }
    }

    pub fn mapping_store(&self, id: &str, cfg: &MigrationConfig) -> Result<SqlMappingStore, ReconError> {
        SqlMappingStore::open(&self.maps_path(), id, cfg.destination.ids.clone())
    }

    pub fn storage(&self, id: &str, cfg: &MigrationConfig) -> Result<JsonFileStorage, ReconError> {
        JsonFileStorage::open(self.content_path(id), entity_type(cfg))
    }

    pub fn migration(&self, id: &str) -> Result<RowMigration, ReconError> {
        let cfg = self.config(id)?;
        let source = CsvSource::new(id, self.manifest.source_path(cfg), cfg.source.ids.clone());
        let mapping = self.mapping_store(id, cfg)?;
        let storage = self.storage(id, cfg)?;

        Ok(RowMigration::new(
            id,
            cfg.source.ids.clone(),
            Box::new(source),
            Box::new(mapping),
            Box::new(storage),
        )
        .with_label(cfg.label_or(id))
        .with_dependencies(cfg.migration_dependencies.required.clone())
        .with_orphan_action(&cfg.source.orphan_action)
        .with_process(cfg.process.clone())
        .with_track_changes(cfg.source.track_changes))
    }

    /// Every enabled migration.
    pub fn registry(&self) -> Result<MemoryRegistry, ReconError> {
        let mut registry = MemoryRegistry::new();
        for (id, _) in self.manifest.enabled() {
            registry.insert(Box::new(self.migration(id)?));
        }
        Ok(registry)
    }

    pub fn run_guard(&self) -> Result<RunGuard, ReconError> {
        let cache = SqlGuardCache::open(&self.guard_path())?;
        Ok(RunGuard::new(Box::new(cache), Box::new(SystemClock)))
    }

    pub fn reconciler(&self) -> Result<Reconciler, ReconError> {
        Ok(Reconciler::new(self.run_guard()?).with_ttl(self.settings.guard_ttl_secs))
    }

    /// Enabled migrations writing to `entity_type` that recorded `id` as a
    /// destination.
    pub fn owners(&self, entity_type: &str, id: &str) -> Result<Vec<Ownership>, ReconError> {
        let mut owners = Vec::new();
        for (mid, cfg) in self.manifest.enabled() {
            if cfg.destination.entity_type() != Some(entity_type) {
                continue;
            }
            let Some(field) = cfg.destination.ids.first() else { continue };

            let mut values = BTreeMap::new();
            values.insert(field.clone(), IdentityValue::parse_loose(id));
            if let Some(record) = self.mapping_store(mid, cfg)?.row_by_destination(&values)? {
                owners.push(Ownership {
                    migration: mid.to_string(),
                    label: cfg.label_or(mid).to_string(),
                    source_key: record.source_key,
                    status: record.status,
                });
            }
        }
        Ok(owners)
    }
}

pub fn entity_type(cfg: &MigrationConfig) -> EntityType {
    let mut t = EntityType::new(cfg.destination.entity_type().unwrap_or("entity"));
    if let Some(key) = &cfg.destination.status_key {
        t = t.with_status_key(key);
    }
    if let Some(key) = &cfg.destination.label_key {
        t = t.with_label_key(key);
    }
    if cfg.destination.revisionable {
        t = t.revisionable();
    }
    t
}

/// Resolve the state directory: flag, then settings, then platform default.
pub fn resolve_state_dir(flag: Option<&Path>, settings: &Settings) -> PathBuf {
    match flag {
        Some(dir) => dir.to_path_buf(),
        None => settings.effective_state_dir(),
    }
}
