// mrecon - batched content migrations with orphan reconciliation

mod exit_codes;
mod inspect;
mod migrate;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use migrate_config::{Manifest, ManifestError, Settings};
use migrate_recon::ReconError;

use exit_codes::{recon_exit_code, EXIT_ERROR, EXIT_MANIFEST_INVALID, EXIT_SUCCESS, EXIT_USAGE};
use state::Workspace;

#[derive(Parser)]
#[command(name = "mrecon")]
#[command(about = "Batched content migrations with orphan reconciliation")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Migration manifest (TOML)
    #[arg(long, short = 'm', global = true, env = "MRECON_MANIFEST", default_value = "migrations.toml")]
    manifest: PathBuf,

    /// State directory (mapping tables, run guard, content). Overrides settings.
    #[arg(long, global = true, env = "MRECON_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Settings file (default: <config dir>/mrecon/settings.json)
    #[arg(long, global = true, env = "MRECON_SETTINGS")]
    settings: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short = 'v', global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Warnings and errors only
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enabled migrations by group
    #[command(after_help = "\
Examples:
  mrecon list
  mrecon list --json")]
    List {
        /// Output JSON to stdout
        #[arg(long)]
        json: bool,
    },

    /// Import a migration (dependencies first), then reconcile orphans
    #[command(after_help = "\
Examples:
  mrecon import news
  mrecon import news --batch-limit 50
  mrecon import news --item-limit 100 --json")]
    Import {
        /// Migration id
        id: String,

        /// Rows per step (default: settings `batch.limit`)
        #[arg(long)]
        batch_limit: Option<usize>,

        /// Stop each migration after this many rows
        #[arg(long)]
        item_limit: Option<usize>,

        /// Skip post-import reconciliation
        #[arg(long)]
        no_reconcile: bool,

        /// Output JSON to stdout
        #[arg(long)]
        json: bool,
    },

    /// Reconcile orphans for one migration without importing
    #[command(after_help = "\
Examples:
  mrecon reconcile news
  mrecon reconcile news --force")]
    Reconcile {
        /// Migration id
        id: String,

        /// Ignore the cooldown window
        #[arg(long)]
        force: bool,

        /// Output JSON to stdout
        #[arg(long)]
        json: bool,
    },

    /// Wipe a migration's mapping table (destination content is kept)
    Forget {
        /// Migration id
        id: String,
    },

    /// Write a blank CSV with the configured source field headers
    #[command(after_help = "\
Examples:
  mrecon template news
  mrecon template news -o news.csv")]
    Template {
        /// Migration id
        id: String,

        /// Output file (omit for stdout)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Find which migration imported a destination entity
    #[command(after_help = "\
Examples:
  mrecon owner node 42")]
    Owner {
        /// Entity type, e.g. node
        entity_type: String,

        /// Destination id
        id: String,

        /// Output JSON to stdout
        #[arg(long)]
        json: bool,
    },

    /// Check the manifest without running anything
    Validate {
        /// Treat warnings as errors
        #[arg(long)]
        strict: bool,
    },
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("MRECON_COMMIT"), ")",
        "\nengine:  migrate-recon ", env!("CARGO_PKG_VERSION"),
        "\ntarget:  ", env!("MRECON_TARGET"),
    )
}

fn init_logging(verbose: bool, quiet: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    } else if quiet {
        builder.filter_level(log::LevelFilter::Warn);
    }
    builder.format_timestamp(None).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let result = run(cli);

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let settings = match &cli.settings {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };

    // Validate reads the manifest itself so it can report warnings too.
    if let Commands::Validate { strict } = cli.command {
        return inspect::cmd_validate(&cli.manifest, strict);
    }

    let manifest = Manifest::load(&cli.manifest)?;
    let dir = state::resolve_state_dir(cli.state_dir.as_deref(), &settings);
    let ws = Workspace::open(dir, manifest, settings)?;

    match cli.command {
        Commands::List { json } => inspect::cmd_list(&ws, json),
        Commands::Import {
            id,
            batch_limit,
            item_limit,
            no_reconcile,
            json,
        } => migrate::cmd_import(&ws, &id, batch_limit, item_limit, no_reconcile, json),
        Commands::Reconcile { id, force, json } => migrate::cmd_reconcile(&ws, &id, force, json),
        Commands::Forget { id } => migrate::cmd_forget(&ws, &id),
        Commands::Template { id, output } => inspect::cmd_template(&ws, &id, output),
        Commands::Owner { entity_type, id, json } => inspect::cmd_owner(&ws, &entity_type, &id, json),
        Commands::Validate { .. } => Ok(()),
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), hint: None }
    }

    pub fn args(msg: impl Into<String>) -> Self {
        Self::new(EXIT_USAGE, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(EXIT_ERROR, msg)
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<ReconError> for CliError {
    fn from(err: ReconError) -> Self {
        let hint = match &err {
            ReconError::UnknownMigration(_) => Some("run `mrecon list` to see enabled migrations"),
            ReconError::Source { .. } => Some("check source.path and source.ids in the manifest"),
            ReconError::Mapping(_) => Some("is another mrecon process holding the state directory?"),
            _ => None,
        };
        Self {
            code: recon_exit_code(&err),
            message: err.to_string(),
            hint: hint.map(String::from),
        }
    }
}

impl From<ManifestError> for CliError {
    fn from(err: ManifestError) -> Self {
        let hint = match &err {
            ManifestError::Io(_) => Some("pass --manifest or set MRECON_MANIFEST"),
            _ => None,
        };
        Self {
            code: EXIT_MANIFEST_INVALID,
            message: err.to_string(),
            hint: hint.map(String::from),
        }
    }
}

/// Pretty JSON to stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::io(format!("JSON serialization error: {e}")))?;
    println!("{json}");
    Ok(())
}
