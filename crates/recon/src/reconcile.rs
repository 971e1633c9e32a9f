//! Orphan reconciliation: find previously imported records that are no longer
//! in the source and apply the configured disposition to each, once.

use serde::Serialize;

use crate::disposition::{AuditNotice, DispositionOutcome, OrphanAction};
use crate::entity::DestinationStorage;
use crate::guard::{RunGuard, DEFAULT_GUARD_TTL_SECS};
use crate::identity::IdentityKey;
use crate::mapping::MappingStore;
use crate::migration::{Collaborators, Migration};
use crate::source::SourceProvider;

// ---------------------------------------------------------------------------
// Working set
// ---------------------------------------------------------------------------

/// Current-source keys not yet matched by a mapping record.
///
/// Matched keys are removed so each later scan covers a shrinking candidate
/// list. Removal is `swap_remove`: order is not preserved, which only matters
/// for duplicate keys, and duplicates are interchangeable.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    keys: Vec<IdentityKey>,
}

impl WorkingSet {
    pub fn new(keys: Vec<IdentityKey>) -> Self {
        Self { keys }
    }

    /// Remove the first key equal to `key`. Returns whether one was found.
    pub fn take_match(&mut self, key: &IdentityKey) -> bool {
        match self.keys.iter().position(|k| k == key) {
            Some(i) => {
                self.keys.swap_remove(i);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Completed,
    /// No orphan action configured.
    Disabled,
    /// A pass for this migration ran within the guard window.
    Cooldown,
    /// Orphan action could not be parsed; nothing was touched.
    Misconfigured,
    /// Source or mapping store could not be read; nothing was touched.
    Aborted,
}

impl std::fmt::Display for PassStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Disabled => write!(f, "disabled"),
            Self::Cooldown => write!(f, "cooldown"),
            Self::Misconfigured => write!(f, "misconfigured"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub migration_id: String,
    pub status: PassStatus,
    pub action: OrphanAction,
    /// Mapping records looked at.
    pub examined: usize,
    pub orphans_found: usize,
    pub applied: usize,
    /// Orphans left alone by the disposition (e.g. already unpublished).
    pub skipped: usize,
    /// Orphans whose destination id or entity could not be resolved.
    pub not_found: usize,
    /// Orphans whose disposition errored.
    pub failed: usize,
    pub notices: Vec<AuditNotice>,
}

impl ReconcileReport {
    pub fn empty(migration_id: &str, status: PassStatus, action: OrphanAction) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            status,
            action,
            examined: 0,
            orphans_found: 0,
            applied: 0,
            skipped: 0,
            not_found: 0,
            failed: 0,
            notices: Vec::new(),
        }
    }

    /// Records confirmed still present in the source.
    pub fn matched(&self) -> usize {
        self.examined - self.orphans_found
    }

    pub fn is_empty(&self) -> bool {
        self.examined == 0
    }

    pub fn summary(&self) -> String {
        match self.status {
            PassStatus::Completed => format!(
                "reconcile {}: {} examined, {} orphans ({} {}, {} skipped, {} not found, {} failed)",
                self.migration_id,
                self.examined,
                self.orphans_found,
                self.applied,
                match self.action {
                    OrphanAction::Delete => "deleted",
                    OrphanAction::Unpublish => "unpublished",
                    OrphanAction::None => "applied",
                },
                self.skipped,
                self.not_found,
                self.failed,
            ),
            status => format!("reconcile {}: {status}", self.migration_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Identifies the migration being reconciled.
#[derive(Debug, Clone, Copy)]
pub struct MigrationRef<'a> {
    pub id: &'a str,
    pub label: &'a str,
}

pub struct Reconciler {
    guard: RunGuard,
    ttl_secs: u64,
}

impl Reconciler {
    pub fn new(guard: RunGuard) -> Self {
        Self {
            guard,
            ttl_secs: DEFAULT_GUARD_TTL_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn guard(&self) -> &RunGuard {
        &self.guard
    }

    /// Post-import hook: reconcile a migration with its own collaborators and
    /// configured orphan action.
    pub fn reconcile_migration(&self, migration: &mut dyn Migration) -> ReconcileReport {
        let id = migration.id().to_string();
        let label = migration.label().to_string();
        let raw_action = migration.orphan_action().to_string();
        let Collaborators { source, mapping, storage } = migration.collaborators();
        self.reconcile_configured(MigrationRef { id: &id, label: &label }, &raw_action, source, mapping, storage)
    }

    /// Parse the configured action, then reconcile. An unrecognized action
    /// skips the pass without touching any collaborator.
    pub fn reconcile_configured(
        &self,
        migration: MigrationRef<'_>,
        raw_action: &str,
        source: &mut dyn SourceProvider,
        mapping: &mut dyn MappingStore,
        storage: &mut dyn DestinationStorage,
    ) -> ReconcileReport {
        match raw_action.parse::<OrphanAction>() {
            Ok(action) => self.reconcile(migration, action, source, mapping, storage),
            Err(e) => {
                log::error!("migration '{}': {e}; orphan reconciliation skipped", migration.id);
                ReconcileReport::empty(migration.id, PassStatus::Misconfigured, OrphanAction::None)
            }
        }
    }

    pub fn reconcile(
        &self,
        migration: MigrationRef<'_>,
        action: OrphanAction,
        source: &mut dyn SourceProvider,
        mapping: &mut dyn MappingStore,
        storage: &mut dyn DestinationStorage,
    ) -> ReconcileReport {
        if action == OrphanAction::None {
            return ReconcileReport::empty(migration.id, PassStatus::Disabled, action);
        }

        if self.guard.should_skip(migration.id) {
            log::debug!("migration '{}': reconciled recently, skipping", migration.id);
            return ReconcileReport::empty(migration.id, PassStatus::Cooldown, action);
        }
        // Marked before the work so a duplicate trigger during a long pass skips too.
        self.guard.mark_run(migration.id, self.ttl_secs);

        let current = match source.all_current_identity_keys() {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("migration '{}': cannot read current source ids: {e}", migration.id);
                return ReconcileReport::empty(migration.id, PassStatus::Aborted, action);
            }
        };
        let mut working = WorkingSet::new(current);

        if let Err(e) = mapping.rewind() {
            log::error!("migration '{}': cannot read mapping store: {e}", migration.id);
            return ReconcileReport::empty(migration.id, PassStatus::Aborted, action);
        }

        let mut report = ReconcileReport::empty(migration.id, PassStatus::Completed, action);

        while let Some(key) = mapping.current_identity_key().cloned() {
            report.examined += 1;
            if !working.take_match(&key) {
                report.orphans_found += 1;
                self.dispose(migration, action, &key, mapping, storage, &mut report);
            }
            mapping.advance();
        }

        log::debug!("{}", report.summary());
        report
    }

    fn dispose(
        &self,
        migration: MigrationRef<'_>,
        action: OrphanAction,
        key: &IdentityKey,
        mapping: &dyn MappingStore,
        storage: &mut dyn DestinationStorage,
        report: &mut ReconcileReport,
    ) {
        let destination = match mapping.resolve_destination_id(key) {
            Ok(dest) => dest.and_then(|d| d.into_scalar()),
            Err(e) => {
                log::warn!("migration '{}': destination lookup failed for {key}: {e}", migration.id);
                None
            }
        };
        let Some(destination) = destination else {
            report.not_found += 1;
            return;
        };

        let entity = match storage.load(&destination) {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                report.not_found += 1;
                return;
            }
            Err(e) => {
                log::warn!("migration '{}': cannot load {destination} for {key}: {e}", migration.id);
                report.not_found += 1;
                return;
            }
        };

        let label = storage.entity_type().label(&entity);
        match action.apply(entity, storage, migration.label) {
            Ok((DispositionOutcome::Applied, notice)) => {
                report.applied += 1;
                report.notices.extend(notice);
            }
            Ok((DispositionOutcome::Skipped, _)) => report.skipped += 1,
            Err(e) => {
                log::error!(
                    "failed to {action} orphan. Migration: {}, Entity Type: {}, Label: {label}: {e}",
                    migration.label,
                    storage.entity_type().id,
                );
                report.failed += 1;
            }
        }
    }
}
