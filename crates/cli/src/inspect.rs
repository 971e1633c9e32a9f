//! Read-only commands: `list`, `owner`, `template`, `validate`.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use migrate_config::Manifest;
use migrate_recon::{CsvSource, MappingStore, OrphanAction, SourceProvider};

use crate::exit_codes::{EXIT_ERROR, EXIT_MANIFEST_WARNINGS};
use crate::state::Workspace;
use crate::{print_json, CliError};

// ============================================================================
// list
// ============================================================================

#[derive(Debug, Serialize)]
struct ListEntry<'a> {
    id: &'a str,
    label: &'a str,
    group: &'a str,
    dependencies: &'a [String],
    orphan_action: &'a str,
    /// None when the source could not be read.
    source_rows: Option<usize>,
    imported: Option<usize>,
}

pub fn cmd_list(ws: &Workspace, json: bool) -> Result<(), CliError> {
    let mut entries = Vec::new();
    for (group, ids) in ws.manifest.groups() {
        for id in ids {
            let cfg = ws.config(id)?;
            let source_rows = CsvSource::new(id, ws.manifest.source_path(cfg), cfg.source.ids.clone())
                .count()
                .map_err(|e| log::debug!("{e}"))
                .ok();
            let imported = ws
                .mapping_store(id, cfg)
                .and_then(|store| store.len())
                .map_err(|e| log::debug!("{e}"))
                .ok();
            entries.push(ListEntry {
                id,
                label: cfg.label_or(id),
                group,
                dependencies: &cfg.migration_dependencies.required,
                orphan_action: &cfg.source.orphan_action,
                source_rows,
                imported,
            });
        }
    }

    if json {
        return print_json(&entries);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut current_group = "";
    for e in &entries {
        if e.group != current_group {
            writeln!(out, "{}", e.group).map_err(|err| CliError::io(err.to_string()))?;
            current_group = e.group;
        }
        let count = |n: Option<usize>| n.map(|n| n.to_string()).unwrap_or_else(|| "?".into());
        writeln!(
            out,
            "  {:<20} {:<30} {} rows, {} imported",
            e.id,
            e.label,
            count(e.source_rows),
            count(e.imported)
        )
        .map_err(|err| CliError::io(err.to_string()))?;
    }
    Ok(())
}

// ============================================================================
// owner
// ============================================================================

pub fn cmd_owner(ws: &Workspace, entity_type: &str, id: &str, json: bool) -> Result<(), CliError> {
    let owners = ws.owners(entity_type, id)?;

    if json {
        return print_json(&owners);
    }
    if owners.is_empty() {
        return Err(CliError::new(EXIT_ERROR, format!("no migration imported {entity_type} {id}")));
    }
    for o in &owners {
        println!(
            "{entity_type} {id}: imported by '{}' ({}) from source key {}, status {}",
            o.migration, o.label, o.source_key, o.status
        );
    }
    Ok(())
}

// ============================================================================
// template
// ============================================================================

pub fn cmd_template(ws: &Workspace, id: &str, output: Option<PathBuf>) -> Result<(), CliError> {
    let cfg = ws.config(id)?;
    let header = cfg.csv_template_header();
    if header.is_empty() {
        return Err(CliError::args(format!("migration '{id}' has no source.fields"))
            .with_hint("add [[migrations.<id>.source.fields]] entries with selector and label"));
    }
    let bytes = template_csv(&header)?;

    match output {
        Some(path) => {
            std::fs::write(&path, bytes)
                .map_err(|e| CliError::io(format!("cannot write {}: {e}", path.display())))?;
            eprintln!("wrote {}", path.display());
        }
        None => std::io::stdout()
            .write_all(&bytes)
            .map_err(|e| CliError::io(e.to_string()))?,
    }
    Ok(())
}

/// A CSV file holding only the header record.
fn template_csv(header: &[String]) -> Result<Vec<u8>, CliError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record(header)
        .map_err(|e| CliError::io(format!("CSV write error: {e}")))?;
    writer
        .into_inner()
        .map_err(|e| CliError::io(format!("CSV write error: {e}")))
}

// ============================================================================
// validate
// ============================================================================

/// Problems that do not stop a run but probably are not intended.
pub fn manifest_warnings(manifest: &Manifest) -> Vec<String> {
    let mut warnings = Vec::new();
    for (id, cfg) in &manifest.migrations {
        if let Err(e) = cfg.source.orphan_action.parse::<OrphanAction>() {
            warnings.push(format!("migration '{id}': {e}; orphans will not be reconciled"));
        }
        if !cfg.status {
            continue;
        }
        let path = manifest.source_path(cfg);
        if !path.exists() {
            warnings.push(format!("migration '{id}': source file {} does not exist", path.display()));
        }
        for dep in &cfg.migration_dependencies.required {
            if manifest.get(dep).is_some_and(|d| !d.status) {
                warnings.push(format!("migration '{id}': required dependency '{dep}' is disabled"));
            }
        }
    }
    warnings
}

pub fn cmd_validate(manifest_path: &Path, strict: bool) -> Result<(), CliError> {
    let manifest = Manifest::load(manifest_path)?;
    let warnings = manifest_warnings(&manifest);
    for w in &warnings {
        eprintln!("warning: {w}");
    }

    let total = manifest.migrations.len();
    let enabled = manifest.enabled().count();
    eprintln!("ok: {total} migrations ({enabled} enabled), {} warnings", warnings.len());

    if strict && !warnings.is_empty() {
        return Err(CliError::new(EXIT_MANIFEST_WARNINGS, "manifest has warnings (--strict)"));
    }
    Ok(())
}
