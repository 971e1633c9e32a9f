//! Batch driver: runs an import as a sequence of small, resumable steps.
//!
//! There is no cancel primitive. A step boundary is the only suspension point;
//! a caller that wants to stop simply does not ask for the next step. Rows
//! written during a step are kept.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::error::ReconError;
use crate::migration::{ImportCounts, ImportResult, MigrationRegistry, MigrationStatus};
use crate::reconcile::{ReconcileReport, Reconciler};

pub const DEFAULT_BATCH_LIMIT: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Rows per step.
    pub batch_limit: usize,
    /// Stop the whole import after this many rows.
    pub item_limit: Option<usize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            item_limit: None,
        }
    }
}

/// Cumulative counts for one migration across the steps of one import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchTotals {
    pub name: String,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub ignored: usize,
}

impl BatchTotals {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn add(&mut self, counts: &ImportCounts) {
        self.processed += counts.processed;
        self.created += counts.created;
        self.updated += counts.updated;
        self.failed += counts.failed;
        self.ignored += counts.ignored;
    }

    pub fn summary(&self) -> String {
        format!(
            "Processed {} items ({} created, {} updated, {} failed, {} ignored) - done with '{}'",
            self.processed, self.created, self.updated, self.failed, self.ignored, self.name
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub migration_id: String,
    pub result: ImportResult,
    pub processed_delta: usize,
    pub created_delta: usize,
    pub updated_delta: usize,
    pub failed_delta: usize,
    pub ignored_delta: usize,
    pub fraction_done: f64,
    pub done: bool,
    /// Progress line between steps, final summary on the last one.
    pub message: String,
    /// Post-import reconciliation, run after the final step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<ReconcileReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub migration_id: String,
    pub result: ImportResult,
    pub totals: BatchTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<ReconcileReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub migrations: Vec<MigrationOutcome>,
}

impl BatchSummary {
    pub fn failed(&self) -> usize {
        self.migrations.iter().map(|m| m.totals.failed).sum()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Sandbox {
    total: usize,
    counter: usize,
    batch_limit: usize,
}

pub struct BatchDriver {
    options: BatchOptions,
    reconciler: Option<Reconciler>,
    sandboxes: HashMap<String, Sandbox>,
    results: BTreeMap<String, BatchTotals>,
}

impl BatchDriver {
    pub fn new(options: BatchOptions) -> Self {
        Self {
            options,
            reconciler: None,
            sandboxes: HashMap::new(),
            results: BTreeMap::new(),
        }
    }

    /// Run `reconciler` synchronously after each migration's final step.
    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn totals(&self, migration_id: &str) -> Option<&BatchTotals> {
        self.results.get(migration_id)
    }

    /// Interrupt and reset to idle `id` and, depth first, every required
    /// dependency, so a stale status from a crashed run never blocks this one.
    pub fn prepare(&self, registry: &mut dyn MigrationRegistry, id: &str) -> Result<(), ReconError> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        prepare_recursive(registry, id, &mut visited, &mut path)
    }

    /// Execution order: required dependencies first (depth first), then `root`.
    /// Each migration appears once.
    pub fn operations(&self, registry: &dyn MigrationRegistry, root: &str) -> Result<Vec<String>, ReconError> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        plan_recursive(registry, root, &mut visited, &mut path, &mut order)?;
        Ok(order)
    }

    /// First step of a fresh import: reset statuses, rewind the source, count
    /// the rows once and zero the totals.
    fn start(&mut self, registry: &mut dyn MigrationRegistry, id: &str) -> Result<Sandbox, ReconError> {
        self.prepare(registry, id)?;
        let migration = registry
            .migration_mut(id)
            .ok_or_else(|| ReconError::UnknownMigration(id.to_string()))?;
        migration.start_run()?;
        let total = migration.source_count()?;
        self.results.insert(id.to_string(), BatchTotals::new(migration.label()));
        log::debug!("migration '{id}': starting import of {total} rows");
        Ok(Sandbox {
            total,
            counter: 0,
            batch_limit: self.options.batch_limit.max(1),
        })
    }

    /// Run one step of `id`'s import.
    pub fn run_step(&mut self, registry: &mut dyn MigrationRegistry, id: &str) -> Result<StepResult, ReconError> {
        let mut sandbox = match self.sandboxes.get(id) {
            Some(sandbox) => *sandbox,
            None => self.start(registry, id)?,
        };

        let migration = registry
            .migration_mut(id)
            .ok_or_else(|| ReconError::UnknownMigration(id.to_string()))?;
        let totals = self
            .results
            .entry(id.to_string())
            .or_insert_with(|| BatchTotals::new(migration.label()));

        let remaining = self.options.item_limit.map(|max| max.saturating_sub(sandbox.counter));
        let limit = match remaining {
            Some(r) => sandbox.batch_limit.min(r),
            None => sandbox.batch_limit,
        };

        let (mut result, counts) = if limit == 0 {
            (ImportResult::Completed, ImportCounts::default())
        } else {
            migration.import(limit)
        };
        totals.add(&counts);
        sandbox.counter = totals.processed;

        if result == ImportResult::Incomplete {
            if counts.processed == 0 {
                log::warn!("migration '{id}': step made no progress, stopping");
                result = ImportResult::Failed;
            } else if remaining.is_some_and(|r| counts.processed >= r) {
                result = ImportResult::Completed;
            }
        }

        let done = result != ImportResult::Incomplete;
        let fraction_done = if done {
            1.0
        } else if sandbox.total == 0 {
            0.0
        } else {
            (sandbox.counter as f64 / sandbox.total as f64).min(1.0)
        };

        let message = if done {
            totals.summary()
        } else {
            format!("Importing {} ({}%).", migration.label(), (fraction_done * 100.0) as u32)
        };
        log::debug!("migration '{id}': {message}");

        let mut step = StepResult {
            migration_id: id.to_string(),
            result,
            processed_delta: counts.processed,
            created_delta: counts.created,
            updated_delta: counts.updated,
            failed_delta: counts.failed,
            ignored_delta: counts.ignored,
            fraction_done,
            done,
            message,
            reconcile: None,
        };

        if done {
            self.sandboxes.remove(id);
            if result == ImportResult::Completed {
                if let Some(reconciler) = &self.reconciler {
                    step.reconcile = Some(reconciler.reconcile_migration(migration));
                }
            }
        } else {
            self.sandboxes.insert(id.to_string(), sandbox);
        }

        Ok(step)
    }

    /// Drive `root` and its dependencies to completion, one step at a time.
    pub fn run_to_completion(
        &mut self,
        registry: &mut dyn MigrationRegistry,
        root: &str,
        mut on_step: impl FnMut(&StepResult),
    ) -> Result<BatchSummary, ReconError> {
        let plan = self.operations(&*registry, root)?;
        let mut summary = BatchSummary::default();

        for id in plan {
            loop {
                let step = self.run_step(registry, &id)?;
                on_step(&step);
                if step.done {
                    summary.migrations.push(MigrationOutcome {
                        migration_id: id.clone(),
                        result: step.result,
                        totals: self.results.get(&id).cloned().unwrap_or_default(),
                        reconcile: step.reconcile,
                    });
                    break;
                }
            }
        }

        Ok(summary)
    }
}

fn prepare_recursive(
    registry: &mut dyn MigrationRegistry,
    id: &str,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Result<(), ReconError> {
    if path.iter().any(|p| p == id) {
        log::warn!("dependency cycle: {} -> {id}", path.join(" -> "));
        return Ok(());
    }
    if !visited.insert(id.to_string()) {
        return Ok(());
    }

    let migration = registry
        .migration_mut(id)
        .ok_or_else(|| ReconError::UnknownMigration(id.to_string()))?;
    migration.interrupt(ImportResult::Stopped);
    migration.set_status(MigrationStatus::Idle);
    let dependencies = migration.required_dependencies();

    path.push(id.to_string());
    for dependency in dependencies {
        prepare_recursive(registry, &dependency, visited, path)?;
    }
    path.pop();
    Ok(())
}

fn plan_recursive(
    registry: &dyn MigrationRegistry,
    id: &str,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), ReconError> {
    if path.iter().any(|p| p == id) {
        log::warn!("dependency cycle: {} -> {id}", path.join(" -> "));
        return Ok(());
    }
    if !visited.insert(id.to_string()) {
        return Ok(());
    }

    let migration = registry
        .migration(id)
        .ok_or_else(|| ReconError::UnknownMigration(id.to_string()))?;

    path.push(id.to_string());
    for dependency in migration.required_dependencies() {
        plan_recursive(registry, &dependency, visited, path, order)?;
    }
    path.pop();
    order.push(id.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityType, MemoryStorage};
    use crate::executable::RowMigration;
    use crate::mapping::MemoryMappingStore;
    use crate::migration::MemoryRegistry;
    use crate::source::{MemorySource, SourceRow};
    use serde_json::json;

    fn migration(id: &str, rows: usize, deps: &[&str]) -> Box<RowMigration> {
        let rows = (1..=rows)
            .map(|i| {
                let mut row = SourceRow::new();
                row.insert("id".into(), json!(format!("{id}{i}")));
                row
            })
            .collect();
        Box::new(
            RowMigration::new(
                id,
                vec!["id".into()],
                Box::new(MemorySource::new(vec!["id".into()], rows)),
                Box::new(MemoryMappingStore::new(vec!["id".into()])),
                Box::new(MemoryStorage::new(EntityType::new("node"))),
            )
            .with_dependencies(deps.iter().map(|d| d.to_string()).collect()),
        )
    }

    #[test]
    fn shared_dependency_is_planned_once() {
        let mut registry = MemoryRegistry::new();
        registry.insert(migration("vocab", 1, &[]));
        registry.insert(migration("tags", 1, &["vocab"]));
        registry.insert(migration("authors", 1, &["vocab"]));
        registry.insert(migration("articles", 1, &["tags", "authors"]));

        let driver = BatchDriver::new(BatchOptions::default());
        let plan = driver.operations(&registry, "articles").unwrap();
        assert_eq!(plan, vec!["vocab", "tags", "authors", "articles"]);
    }

    #[test]
    fn totals_restart_with_each_import() {
        let mut registry = MemoryRegistry::new();
        registry.insert(migration("tags", 4, &[]));
        let mut driver = BatchDriver::new(BatchOptions {
            batch_limit: 3,
            item_limit: None,
        });

        let first = driver.run_step(&mut registry, "tags").unwrap();
        assert!(!first.done);
        assert_eq!(first.fraction_done, 0.75);
        assert_eq!(first.message, "Importing tags (75%).");

        let last = driver.run_step(&mut registry, "tags").unwrap();
        assert!(last.done);
        assert_eq!(last.fraction_done, 1.0);
        assert_eq!(driver.totals("tags").unwrap().created, 4);

        // A fresh import counts from zero; unchanged rows are ignored.
        let again = driver.run_step(&mut registry, "tags").unwrap();
        assert_eq!(again.processed_delta, 3);
        let totals = driver.totals("tags").unwrap();
        assert_eq!(totals.processed, 3);
        assert_eq!(totals.ignored, 3);
    }
}
