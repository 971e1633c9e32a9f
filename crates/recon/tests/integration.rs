use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;

use migrate_recon::batch::{BatchDriver, BatchOptions};
use migrate_recon::entity::{DestinationStorage, Entity, EntityType, MemoryStorage, REVISION_LOG_FIELD};
use migrate_recon::error::ReconError;
use migrate_recon::guard::{ManualClock, MemoryGuardCache, RunGuard};
use migrate_recon::identity::{DestinationId, IdentityKey, IdentityValue};
use migrate_recon::mapping::{MappingRecord, MappingStatus, MappingStore, MemoryMappingStore};
use migrate_recon::migration::{
    Collaborators, ImportCounts, ImportResult, MemoryRegistry, Migration, MigrationRegistry, MigrationStatus,
};
use migrate_recon::reconcile::{MigrationRef, PassStatus, Reconciler};
use migrate_recon::source::{CsvSource, MemorySource, SourceProvider, SourceRow};
use migrate_recon::{OrphanAction, RowMigration};

const NEWS: MigrationRef<'static> = MigrationRef {
    id: "news",
    label: "News Feed",
};

fn row(guid: &str, title: &str) -> SourceRow {
    let mut r = SourceRow::new();
    r.insert("guid".into(), json!(guid));
    r.insert("title".into(), json!(title));
    r
}

fn key(guid: &str) -> IdentityKey {
    IdentityKey::new(vec![IdentityValue::Str(guid.into())])
}

fn node_type() -> EntityType {
    EntityType::new("node")
        .with_status_key("status")
        .with_label_key("title")
        .revisionable()
}

fn reconciler() -> Reconciler {
    Reconciler::new(RunGuard::in_memory())
}

/// Storage with one published node per guid, and a mapping guid → node id.
fn imported(guids: &[&str]) -> (MemoryMappingStore, MemoryStorage) {
    let mut storage = MemoryStorage::new(node_type());
    let mut mapping = MemoryMappingStore::new(vec!["nid".into()]);
    for guid in guids {
        let mut e = Entity::default();
        e.set("title", json!(format!("Story {guid}")))
            .set("status", json!(1))
            .set(REVISION_LOG_FIELD, json!(""));
        storage.save(&mut e).unwrap();
        mapping
            .save_mapping(MappingRecord {
                source_key: key(guid),
                destination: e.id.clone().map(DestinationId::Scalar),
                status: MappingStatus::Imported,
                hash: None,
            })
            .unwrap();
    }
    (mapping, storage)
}

fn source(guids: &[&str]) -> MemorySource {
    MemorySource::new(vec!["guid".into()], guids.iter().map(|g| row(g, g)).collect())
}

// -------------------------------------------------------------------------
// Reconciliation
// -------------------------------------------------------------------------

#[test]
fn delete_removes_only_the_orphan() {
    let (mut mapping, mut storage) = imported(&["1", "2", "3"]);
    let mut src = source(&["1", "3"]);

    let report = reconciler().reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);

    assert_eq!(report.status, PassStatus::Completed);
    assert_eq!(report.examined, 3);
    assert_eq!(report.orphans_found, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.matched(), 2);
    assert_eq!(storage.len(), 2);
    assert!(storage.load(&IdentityValue::Int(2)).unwrap().is_none());
    // The mapping row outlives the entity.
    assert_eq!(mapping.len().unwrap(), 3);

    let notice = &report.notices[0];
    assert_eq!(
        notice.to_string(),
        "Deleted entity since it no longer exists in the source data. Migration: News Feed, Entity Type: node, Label: Story 2"
    );
}

#[test]
fn second_delete_pass_finds_nothing_to_delete() {
    let (mut mapping, mut storage) = imported(&["1", "2", "3"]);
    let mut src = source(&["1", "3"]);

    reconciler().reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);
    let again = reconciler().reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);

    assert_eq!(again.orphans_found, 1);
    assert_eq!(again.applied, 0);
    assert_eq!(again.not_found, 1);
    assert_eq!(storage.len(), 2);
}

#[test]
fn unpublish_sets_status_and_revision_log() {
    let (mut mapping, mut storage) = imported(&["1", "2"]);
    let before = storage.load(&IdentityValue::Int(2)).unwrap().unwrap().revision_id;
    let mut src = source(&["1"]);

    let report = reconciler().reconcile(NEWS, OrphanAction::Unpublish, &mut src, &mut mapping, &mut storage);
    assert_eq!(report.applied, 1);

    let e = storage.load(&IdentityValue::Int(2)).unwrap().unwrap();
    assert!(!e.is_truthy("status"));
    assert_eq!(
        e.get(REVISION_LOG_FIELD),
        Some(&json!("Unpublished content since it no longer exists in the source data"))
    );
    assert!(e.revision_id > before);
    assert_eq!(storage.len(), 2);
}

#[test]
fn unpublish_skips_already_unpublished() {
    let (mut mapping, mut storage) = imported(&["1", "2"]);
    let mut e = storage.load(&IdentityValue::Int(2)).unwrap().unwrap();
    e.set("status", json!(0));
    storage.save(&mut e).unwrap();
    let revision = e.revision_id;

    let mut src = source(&["1"]);
    let report = reconciler().reconcile(NEWS, OrphanAction::Unpublish, &mut src, &mut mapping, &mut storage);

    assert_eq!(report.orphans_found, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.applied, 0);
    assert!(report.notices.is_empty());
    assert_eq!(storage.load(&IdentityValue::Int(2)).unwrap().unwrap().revision_id, revision);
}

#[test]
fn empty_source_orphans_everything() {
    let (mut mapping, mut storage) = imported(&["1", "2", "3"]);
    let mut src = source(&[]);
    let report = reconciler().reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);
    assert_eq!(report.orphans_found, 3);
    assert!(storage.is_empty());
}

#[test]
fn empty_mapping_is_a_no_op() {
    let mut mapping = MemoryMappingStore::new(vec!["nid".into()]);
    let mut storage = MemoryStorage::new(node_type());
    let mut src = source(&["1"]);
    let report = reconciler().reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);
    assert_eq!(report.status, PassStatus::Completed);
    assert!(report.is_empty());
}

#[test]
fn unresolvable_destination_counts_not_found() {
    let (mut mapping, mut storage) = imported(&["1"]);
    mapping
        .save_mapping(MappingRecord {
            source_key: key("2"),
            destination: None,
            status: MappingStatus::Failed,
            hash: None,
        })
        .unwrap();
    let mut src = source(&["1"]);
    let report = reconciler().reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);
    assert_eq!(report.orphans_found, 1);
    assert_eq!(report.not_found, 1);
    assert_eq!(storage.len(), 1);
}

// -------------------------------------------------------------------------
// Configuration and guard
// -------------------------------------------------------------------------

#[derive(Default)]
struct CountingSource {
    calls: usize,
}

impl SourceProvider for CountingSource {
    fn count(&mut self) -> Result<usize, ReconError> {
        self.calls += 1;
        Ok(0)
    }
    fn all_current_identity_keys(&mut self) -> Result<Vec<IdentityKey>, ReconError> {
        self.calls += 1;
        Ok(Vec::new())
    }
    fn rows(&mut self) -> Result<Vec<SourceRow>, ReconError> {
        self.calls += 1;
        Ok(Vec::new())
    }
}

struct CountingMapping {
    inner: MemoryMappingStore,
    rewinds: usize,
}

impl MappingStore for CountingMapping {
    fn rewind(&mut self) -> Result<(), ReconError> {
        self.rewinds += 1;
        self.inner.rewind()
    }
    fn current(&self) -> Option<&MappingRecord> {
        self.inner.current()
    }
    fn advance(&mut self) {
        self.inner.advance()
    }
    fn resolve_destination_id(&self, key: &IdentityKey) -> Result<Option<DestinationId>, ReconError> {
        self.inner.resolve_destination_id(key)
    }
    fn lookup(&self, key: &IdentityKey) -> Result<Option<MappingRecord>, ReconError> {
        self.inner.lookup(key)
    }
    fn save_mapping(&mut self, record: MappingRecord) -> Result<(), ReconError> {
        self.inner.save_mapping(record)
    }
    fn row_by_destination(
        &self,
        values: &BTreeMap<String, IdentityValue>,
    ) -> Result<Option<MappingRecord>, ReconError> {
        self.inner.row_by_destination(values)
    }
    fn len(&self) -> Result<usize, ReconError> {
        self.inner.len()
    }
    fn destroy(&mut self) -> Result<(), ReconError> {
        self.inner.destroy()
    }
}

#[test]
fn blank_or_unknown_action_touches_nothing() {
    let (inner, mut storage) = imported(&["1"]);
    let mut mapping = CountingMapping { inner, rewinds: 0 };
    let mut src = CountingSource::default();
    let r = reconciler();

    let blank = r.reconcile_configured(NEWS, "", &mut src, &mut mapping, &mut storage);
    assert_eq!(blank.status, PassStatus::Disabled);

    let typo = r.reconcile_configured(NEWS, "purge", &mut src, &mut mapping, &mut storage);
    assert_eq!(typo.status, PassStatus::Misconfigured);

    assert_eq!(src.calls, 0);
    assert_eq!(mapping.rewinds, 0);
    assert_eq!(storage.len(), 1);
    // Neither pass consumed the guard window.
    assert!(!r.guard().should_skip("news"));
}

#[test]
fn double_trigger_reconciles_once() {
    let (mut mapping, mut storage) = imported(&["1", "2"]);
    let mut src = source(&["1"]);
    let r = reconciler();

    let first = r.reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);
    let second = r.reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);

    assert!(!first.is_empty());
    assert_eq!(second.status, PassStatus::Cooldown);
    assert!(second.is_empty());
}

#[test]
fn guard_window_expires() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()));
    let r = Reconciler::new(RunGuard::new(Box::new(MemoryGuardCache::new()), Box::new(clock.clone())));
    let (mut mapping, mut storage) = imported(&["1", "2", "3"]);

    let mut src = source(&["1", "2"]);
    assert_eq!(r.reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage).applied, 1);

    let mut src = source(&["1"]);
    clock.advance(300);
    let cooled = r.reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);
    assert_eq!(cooled.status, PassStatus::Cooldown);

    clock.advance(5);
    let report = r.reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);
    assert_eq!(report.status, PassStatus::Completed);
    assert_eq!(report.applied, 1);
    assert_eq!(storage.len(), 1);
}

/// Storage whose deletes fail for one id.
struct FlakyStorage {
    inner: MemoryStorage,
    broken: i64,
}

impl DestinationStorage for FlakyStorage {
    fn entity_type(&self) -> &EntityType {
        self.inner.entity_type()
    }
    fn load(&self, id: &IdentityValue) -> Result<Option<Entity>, ReconError> {
        self.inner.load(id)
    }
    fn save(&mut self, entity: &mut Entity) -> Result<(), ReconError> {
        self.inner.save(entity)
    }
    fn delete(&mut self, entity: Entity) -> Result<(), ReconError> {
        if entity.id == Some(IdentityValue::Int(self.broken)) {
            return Err(ReconError::Storage {
                entity_type: "node".into(),
                message: "row locked".into(),
            });
        }
        self.inner.delete(entity)
    }
    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[test]
fn failed_disposition_does_not_stop_the_pass() {
    let (mut mapping, inner) = imported(&["1", "2", "3"]);
    let mut storage = FlakyStorage { inner, broken: 1 };
    let mut src = source(&["3"]);

    let report = reconciler().reconcile(NEWS, OrphanAction::Delete, &mut src, &mut mapping, &mut storage);

    assert_eq!(report.orphans_found, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(storage.len(), 2);
}

#[test]
fn unreadable_source_aborts() {
    struct Broken;
    impl SourceProvider for Broken {
        fn count(&mut self) -> Result<usize, ReconError> {
            Err(ReconError::Io("gone".into()))
        }
        fn all_current_identity_keys(&mut self) -> Result<Vec<IdentityKey>, ReconError> {
            Err(ReconError::Io("gone".into()))
        }
        fn rows(&mut self) -> Result<Vec<SourceRow>, ReconError> {
            Err(ReconError::Io("gone".into()))
        }
    }

    let (mut mapping, mut storage) = imported(&["1"]);
    let report = reconciler().reconcile(NEWS, OrphanAction::Delete, &mut Broken, &mut mapping, &mut storage);
    assert_eq!(report.status, PassStatus::Aborted);
    assert_eq!(storage.len(), 1);
}

// -------------------------------------------------------------------------
// Batch driver
// -------------------------------------------------------------------------

fn row_migration(id: &str, rows: usize, deps: &[&str]) -> RowMigration {
    let rows = (1..=rows).map(|i| row(&format!("{id}-{i}"), &format!("Item {i}"))).collect();
    RowMigration::new(
        id,
        vec!["guid".into()],
        Box::new(MemorySource::new(vec!["guid".into()], rows)),
        Box::new(MemoryMappingStore::new(vec!["nid".into()])),
        Box::new(MemoryStorage::new(node_type())),
    )
    .with_dependencies(deps.iter().map(|d| d.to_string()).collect())
}

fn registry(migrations: Vec<RowMigration>) -> MemoryRegistry {
    let mut reg = MemoryRegistry::new();
    for m in migrations {
        reg.insert(Box::new(m));
    }
    reg
}

#[test]
fn forty_seven_rows_take_four_steps() {
    let mut reg = registry(vec![row_migration("news", 47, &[])]);
    let mut driver = BatchDriver::new(BatchOptions::default());

    let mut steps = Vec::new();
    let summary = driver
        .run_to_completion(&mut reg, "news", |s| steps.push(s.clone()))
        .unwrap();

    assert_eq!(steps.len(), 4);
    let fractions: Vec<f64> = steps.iter().map(|s| s.fraction_done).collect();
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    assert!((fractions[0] - 15.0 / 47.0).abs() < 1e-9);
    assert_eq!(fractions[3], 1.0);
    assert!(steps[..3].iter().all(|s| !s.done));
    assert!(steps[3].done);
    assert_eq!(steps[0].message, "Importing news (31%).");
    assert_eq!(
        steps[3].message,
        "Processed 47 items (47 created, 0 updated, 0 failed, 0 ignored) - done with 'news'"
    );

    assert_eq!(summary.migrations.len(), 1);
    assert_eq!(summary.migrations[0].result, ImportResult::Completed);
    assert_eq!(summary.migrations[0].totals.processed, 47);
}

#[test]
fn item_limit_ends_the_import_early() {
    let mut reg = registry(vec![row_migration("news", 47, &[])]);
    let mut driver = BatchDriver::new(BatchOptions {
        batch_limit: 15,
        item_limit: Some(20),
    });

    let first = driver.run_step(&mut reg, "news").unwrap();
    assert!(!first.done);
    let second = driver.run_step(&mut reg, "news").unwrap();
    assert_eq!(second.processed_delta, 5);
    assert!(second.done);
    assert_eq!(second.result, ImportResult::Completed);
    assert_eq!(driver.totals("news").unwrap().processed, 20);
}

#[test]
fn empty_source_completes_in_one_step() {
    let mut reg = registry(vec![row_migration("news", 0, &[])]);
    let mut driver = BatchDriver::new(BatchOptions::default());
    let step = driver.run_step(&mut reg, "news").unwrap();
    assert!(step.done);
    assert_eq!(step.fraction_done, 1.0);
}

#[test]
fn dependencies_run_first() {
    let reg = registry(vec![
        row_migration("articles", 1, &["tags", "authors"]),
        row_migration("tags", 1, &["vocab"]),
        row_migration("authors", 1, &[]),
        row_migration("vocab", 1, &[]),
    ]);
    let driver = BatchDriver::new(BatchOptions::default());
    assert_eq!(
        driver.operations(&reg, "articles").unwrap(),
        vec!["vocab", "tags", "authors", "articles"]
    );
}

#[test]
fn dependency_cycle_terminates() {
    let mut reg = registry(vec![row_migration("a", 2, &["b"]), row_migration("b", 2, &["a"])]);
    let mut driver = BatchDriver::new(BatchOptions::default());

    assert_eq!(driver.operations(&reg, "a").unwrap(), vec!["b", "a"]);
    let summary = driver.run_to_completion(&mut reg, "a", |_| {}).unwrap();
    assert_eq!(summary.migrations.len(), 2);
}

#[test]
fn unknown_dependency_is_an_error() {
    let reg = registry(vec![row_migration("a", 1, &["ghost"])]);
    let driver = BatchDriver::new(BatchOptions::default());
    match driver.operations(&reg, "a") {
        Err(ReconError::UnknownMigration(id)) => assert_eq!(id, "ghost"),
        other => panic!("expected unknown migration, got {other:?}"),
    }
}

#[test]
fn stale_status_is_reset_before_import() {
    let mut reg = registry(vec![row_migration("news", 3, &["tags"]), row_migration("tags", 3, &[])]);
    reg.migration_mut("news").unwrap().set_status(MigrationStatus::Importing);
    reg.migration_mut("tags").unwrap().set_status(MigrationStatus::Stopping);

    let mut driver = BatchDriver::new(BatchOptions::default());
    let summary = driver.run_to_completion(&mut reg, "news", |_| {}).unwrap();

    assert!(summary.migrations.iter().all(|m| m.result == ImportResult::Completed));
    assert_eq!(reg.migration("tags").unwrap().status(), MigrationStatus::Idle);
    assert_eq!(reg.migration("news").unwrap().status(), MigrationStatus::Idle);
}

/// Reports more work but never moves.
struct Stalled {
    source: MemorySource,
    mapping: MemoryMappingStore,
    storage: MemoryStorage,
    status: MigrationStatus,
}

impl Migration for Stalled {
    fn id(&self) -> &str {
        "stalled"
    }
    fn label(&self) -> &str {
        "Stalled"
    }
    fn status(&self) -> MigrationStatus {
        self.status
    }
    fn set_status(&mut self, status: MigrationStatus) {
        self.status = status;
    }
    fn interrupt(&mut self, _: ImportResult) {
        self.status = MigrationStatus::Stopping;
    }
    fn required_dependencies(&self) -> Vec<String> {
        Vec::new()
    }
    fn orphan_action(&self) -> &str {
        "delete"
    }
    fn source_count(&mut self) -> Result<usize, ReconError> {
        Ok(10)
    }
    fn start_run(&mut self) -> Result<(), ReconError> {
        Ok(())
    }
    fn import(&mut self, _: usize) -> (ImportResult, ImportCounts) {
        (ImportResult::Incomplete, ImportCounts::default())
    }
    fn collaborators(&mut self) -> Collaborators<'_> {
        Collaborators {
            source: &mut self.source,
            mapping: &mut self.mapping,
            storage: &mut self.storage,
        }
    }
}

#[test]
fn step_without_progress_fails_and_skips_reconcile() {
    let (mapping, storage) = imported(&["1"]);
    let mut reg = MemoryRegistry::new();
    reg.insert(Box::new(Stalled {
        source: source(&[]),
        mapping,
        storage,
        status: MigrationStatus::Idle,
    }));

    let mut driver = BatchDriver::new(BatchOptions::default()).with_reconciler(reconciler());
    let step = driver.run_step(&mut reg, "stalled").unwrap();

    assert_eq!(step.result, ImportResult::Failed);
    assert!(step.done);
    assert!(step.reconcile.is_none());
}

#[test]
fn completed_import_reconciles_against_the_csv() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("news.csv");
    std::fs::write(&csv, "guid,title,status\ng1,First,1\ng2,Second,1\ng3,Third,1\n").unwrap();

    let migration = RowMigration::new(
        "news",
        vec!["guid".into()],
        Box::new(CsvSource::new("news", &csv, vec!["guid".into()])),
        Box::new(MemoryMappingStore::new(vec!["nid".into()])),
        Box::new(MemoryStorage::new(node_type())),
    )
    .with_label("News Feed")
    .with_orphan_action("unpublish");
    let mut reg = MemoryRegistry::new();
    reg.insert(Box::new(migration));

    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()));
    let guard = RunGuard::new(Box::new(MemoryGuardCache::new()), Box::new(clock.clone()));
    let mut driver = BatchDriver::new(BatchOptions::default()).with_reconciler(Reconciler::new(guard));

    let first = driver.run_to_completion(&mut reg, "news", |_| {}).unwrap();
    let report = first.migrations[0].reconcile.as_ref().unwrap();
    assert_eq!(report.orphans_found, 0);

    std::fs::write(&csv, "guid,title,status\ng1,First,1\ng3,Third,1\n").unwrap();
    clock.advance(306);

    let second = driver.run_to_completion(&mut reg, "news", |_| {}).unwrap();
    let outcome = &second.migrations[0];
    assert_eq!(outcome.totals.ignored, 2);
    let report = outcome.reconcile.as_ref().unwrap();
    assert_eq!(report.status, PassStatus::Completed);
    assert_eq!(report.applied, 1);
    assert_eq!(report.notices[0].label, "Second");
}
