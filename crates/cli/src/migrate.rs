//! `mrecon import`, `mrecon reconcile`, `mrecon forget`.

use chrono::Utc;
use serde::Serialize;

use migrate_recon::batch::{BatchDriver, BatchOptions, BatchSummary};
use migrate_recon::{ImportResult, MappingStore, PassStatus, ReconError, ReconcileReport};

use crate::exit_codes::{
    EXIT_IMPORT_FAILED, EXIT_IMPORT_ROW_FAILURES, EXIT_RECONCILE_ABORTED, EXIT_RECONCILE_MISCONFIGURED,
    EXIT_RECONCILE_PARTIAL,
};
use crate::state::Workspace;
use crate::{print_json, CliError};

#[derive(Serialize)]
struct ImportOutput<'a> {
    migration: &'a str,
    finished_at: String,
    #[serde(flatten)]
    summary: &'a BatchSummary,
}

// ============================================================================
// import
// ============================================================================

pub fn cmd_import(
    ws: &Workspace,
    id: &str,
    batch_limit: Option<usize>,
    item_limit: Option<usize>,
    no_reconcile: bool,
    json: bool,
) -> Result<(), CliError> {
    ws.config(id)?;

    let options = BatchOptions {
        batch_limit: batch_limit.unwrap_or(ws.settings.batch_limit),
        item_limit: item_limit.or(ws.settings.item_limit),
    };
    if options.batch_limit == 0 {
        return Err(CliError::args("--batch-limit must be at least 1"));
    }

    let mut registry = ws.registry()?;
    let mut driver = BatchDriver::new(options);
    if !no_reconcile {
        driver = driver.with_reconciler(ws.reconciler()?);
    }

    let summary = driver.run_to_completion(&mut registry, id, |step| {
        if json {
            return;
        }
        eprintln!("{}", step.message);
        if let Some(report) = &step.reconcile {
            eprintln!("{}", report.summary());
        }
    })?;

    if json {
        print_json(&ImportOutput {
            migration: id,
            finished_at: Utc::now().to_rfc3339(),
            summary: &summary,
        })?;
    }

    if let Some(m) = summary.migrations.iter().find(|m| m.result == ImportResult::Failed) {
        return Err(CliError::new(EXIT_IMPORT_FAILED, format!("migration '{}' failed", m.migration_id))
            .with_hint("rerun with -v for per-row errors"));
    }
    let failed_rows = summary.failed();
    if failed_rows > 0 {
        return Err(CliError::new(EXIT_IMPORT_ROW_FAILURES, format!("{failed_rows} rows failed to import")));
    }
    for report in summary.migrations.iter().filter_map(|m| m.reconcile.as_ref()) {
        report_exit(report)?;
    }
    Ok(())
}

// ============================================================================
// reconcile
// ============================================================================

pub fn cmd_reconcile(ws: &Workspace, id: &str, force: bool, json: bool) -> Result<(), CliError> {
    let mut migration = ws.migration(id)?;
    let reconciler = ws.reconciler()?;
    if force {
        reconciler.guard().clear(id);
    }

    let report = reconciler.reconcile_migration(&mut migration);

    if json {
        print_json(&report)?;
    } else {
        eprintln!("{}", report.summary());
        if report.status == PassStatus::Cooldown {
            eprintln!("hint:  a pass ran within the last {}s; use --force to run anyway", ws.settings.guard_ttl_secs);
        }
    }
    report_exit(&report)
}

fn report_exit(report: &ReconcileReport) -> Result<(), CliError> {
    match report.status {
        PassStatus::Misconfigured => Err(CliError::new(
            EXIT_RECONCILE_MISCONFIGURED,
            format!("orphan action for '{}' not recognized; nothing was reconciled", report.migration_id),
        )
        .with_hint("set source.orphan_action to \"delete\", \"unpublish\", or leave it empty")),
        PassStatus::Aborted => Err(CliError::new(
            EXIT_RECONCILE_ABORTED,
            format!("reconciliation of '{}' aborted; nothing was touched", report.migration_id),
        )),
        PassStatus::Completed if report.failed > 0 => Err(CliError::new(
            EXIT_RECONCILE_PARTIAL,
            format!("{} of {} orphans could not be processed", report.failed, report.orphans_found),
        )),
        _ => Ok(()),
    }
}

// ============================================================================
// forget
// ============================================================================

pub fn cmd_forget(ws: &Workspace, id: &str) -> Result<(), CliError> {
    let cfg = ws
        .manifest
        .get(id)
        .ok_or_else(|| ReconError::UnknownMigration(id.to_string()))?;

    let mut store = ws.mapping_store(id, cfg)?;
    let rows = store.len()?;
    store.destroy()?;
    ws.run_guard()?.clear(id);

    eprintln!("forgot {rows} mapping rows for '{id}'");
    Ok(())
}
