// Property-based tests for orphan detection and batch stepping.
// CI: 256 cases (default). Soak: PROPTEST_CASES=10000 cargo test --release

use std::collections::BTreeSet;

use proptest::prelude::*;
use serde_json::json;

use migrate_recon::batch::{BatchDriver, BatchOptions};
use migrate_recon::entity::{DestinationStorage, Entity, EntityType, MemoryStorage};
use migrate_recon::identity::{DestinationId, IdentityKey, IdentityValue};
use migrate_recon::mapping::{MappingRecord, MappingStatus, MappingStore, MemoryMappingStore};
use migrate_recon::migration::MemoryRegistry;
use migrate_recon::reconcile::{MigrationRef, Reconciler};
use migrate_recon::source::{MemorySource, SourceRow};
use migrate_recon::{OrphanAction, RowMigration, RunGuard};

fn config() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

fn key(id: u32) -> IdentityKey {
    IdentityKey::new(vec![IdentityValue::Int(id as i64)])
}

fn row(id: u32) -> SourceRow {
    let mut r = SourceRow::new();
    r.insert("id".into(), json!(id));
    r
}

/// Mapping with one entity per key, source with the given (possibly
/// duplicated) keys.
fn fixture(mapped: &BTreeSet<u32>, current: &[u32]) -> (MemorySource, MemoryMappingStore, MemoryStorage) {
    let mut storage = MemoryStorage::new(EntityType::new("node"));
    let mut mapping = MemoryMappingStore::new(vec!["nid".into()]);
    for id in mapped {
        let mut e = Entity::default();
        e.set("source_id", json!(id));
        storage.save(&mut e).unwrap();
        mapping
            .save_mapping(MappingRecord {
                source_key: key(*id),
                destination: e.id.clone().map(DestinationId::Scalar),
                status: MappingStatus::Imported,
                hash: None,
            })
            .unwrap();
    }
    let source = MemorySource::new(vec!["id".into()], current.iter().map(|id| row(*id)).collect());
    (source, mapping, storage)
}

proptest! {
    #![proptest_config(config())]

    #[test]
    fn orphans_are_mapped_minus_current(
        mapped in proptest::collection::btree_set(0u32..40, 0..25),
        current in proptest::collection::vec(0u32..40, 0..30),
    ) {
        let (mut source, mut mapping, mut storage) = fixture(&mapped, &current);
        let reconciler = Reconciler::new(RunGuard::in_memory());
        let report = reconciler.reconcile(
            MigrationRef { id: "p", label: "p" },
            OrphanAction::Delete,
            &mut source,
            &mut mapping,
            &mut storage,
        );

        let current_set: BTreeSet<u32> = current.iter().copied().collect();
        let expected_orphans: BTreeSet<u32> = mapped.difference(&current_set).copied().collect();

        prop_assert_eq!(report.examined, mapped.len());
        prop_assert_eq!(report.orphans_found, expected_orphans.len());
        prop_assert_eq!(report.orphans_found + report.matched(), mapped.len());
        prop_assert_eq!(report.applied, expected_orphans.len());

        let survivors: BTreeSet<u32> = storage
            .entities()
            .filter_map(|e| e.get("source_id").and_then(|v| v.as_u64()).map(|v| v as u32))
            .collect();
        let expected_survivors: BTreeSet<u32> = mapped.intersection(&current_set).copied().collect();
        prop_assert_eq!(survivors, expected_survivors);
        prop_assert_eq!(mapping.len().unwrap(), mapped.len());
    }

    #[test]
    fn steps_cover_every_row_once(rows in 0usize..80, limit in 1usize..20) {
        let source = MemorySource::new(vec!["id".into()], (0..rows as u32).map(row).collect());
        let migration = RowMigration::new(
            "p",
            vec!["id".into()],
            Box::new(source),
            Box::new(MemoryMappingStore::new(vec!["nid".into()])),
            Box::new(MemoryStorage::new(EntityType::new("node"))),
        );
        let mut reg = MemoryRegistry::new();
        reg.insert(Box::new(migration));

        let mut driver = BatchDriver::new(BatchOptions { batch_limit: limit, item_limit: None });
        let mut fractions = Vec::new();
        let summary = driver
            .run_to_completion(&mut reg, "p", |s| fractions.push(s.fraction_done))
            .unwrap();

        let expected_steps = rows.div_ceil(limit).max(1);
        prop_assert_eq!(fractions.len(), expected_steps);
        prop_assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(fractions.iter().all(|f| (0.0..=1.0).contains(f)));
        prop_assert_eq!(fractions.last().copied(), Some(1.0));
        prop_assert_eq!(summary.migrations[0].totals.created, rows);
    }
}
