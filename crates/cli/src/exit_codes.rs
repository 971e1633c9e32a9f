//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract: cron jobs and deploy scripts
//! rely on them.
//!
//! # Exit Code Ranges
//!
//! | Range   | Domain     | Description                                |
//! |---------|------------|--------------------------------------------|
//! | 0       | Universal  | Success                                    |
//! | 1       | Universal  | General error (unspecified)                |
//! | 2       | Universal  | CLI usage error (bad args, missing file)   |
//! | 3-9     | manifest   | Manifest and state directory codes         |
//! | 10-19   | import     | Batched import codes                       |
//! | 20-29   | reconcile  | Orphan reconciliation codes                |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant in the appropriate range
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into the relevant command's error handling

use migrate_recon::ReconError;

// =============================================================================
// Universal (0-2)
// =============================================================================

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
/// Avoid using this; prefer a specific error code.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, missing required options.
pub const EXIT_USAGE: u8 = 2;

// =============================================================================
// Manifest / state (3-9)
// =============================================================================

/// Manifest could not be read, parsed, or failed validation.
pub const EXIT_MANIFEST_INVALID: u8 = 3;

/// Migration id not in the manifest, or disabled.
pub const EXIT_UNKNOWN_MIGRATION: u8 = 4;

/// State directory, mapping tables, or content files unusable.
pub const EXIT_STATE: u8 = 5;

/// `validate --strict` found warnings.
pub const EXIT_MANIFEST_WARNINGS: u8 = 6;

// =============================================================================
// Import (10-19)
// =============================================================================

/// A migration in the plan ended Failed (or made no progress).
pub const EXIT_IMPORT_FAILED: u8 = 10;

/// Import completed but some rows failed.
pub const EXIT_IMPORT_ROW_FAILURES: u8 = 11;

/// Source file missing or unreadable.
pub const EXIT_IMPORT_SOURCE: u8 = 12;

// =============================================================================
// Reconcile (20-29)
// =============================================================================

/// Orphan action not recognized; nothing was touched.
pub const EXIT_RECONCILE_MISCONFIGURED: u8 = 20;

/// Source or mapping store unreadable; nothing was touched.
pub const EXIT_RECONCILE_ABORTED: u8 = 21;

/// Pass completed but some dispositions failed.
pub const EXIT_RECONCILE_PARTIAL: u8 = 22;

/// Map a ReconError to its exit code.
pub fn recon_exit_code(err: &ReconError) -> u8 {
    match err {
        ReconError::ConfigParse(_) | ReconError::ConfigValidation(_) => EXIT_MANIFEST_INVALID,
        ReconError::UnknownOrphanAction(_) => EXIT_RECONCILE_MISCONFIGURED,
        ReconError::UnknownMigration(_) => EXIT_UNKNOWN_MIGRATION,
        ReconError::Source { .. } => EXIT_IMPORT_SOURCE,
        ReconError::Storage { .. } | ReconError::Mapping(_) | ReconError::Io(_) => EXIT_STATE,
    }
}
