//! The migration abstraction the batch driver and reconciler operate on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::DestinationStorage;
use crate::error::ReconError;
use crate::mapping::MappingStore;
use crate::source::SourceProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Idle,
    Importing,
    RollingBack,
    Stopping,
    Disabled,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Importing => write!(f, "importing"),
            Self::RollingBack => write!(f, "rolling_back"),
            Self::Stopping => write!(f, "stopping"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Result of one bounded import call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportResult {
    Completed,
    /// Stopped at the row limit with rows left in the source.
    Incomplete,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCounts {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub ignored: usize,
}

/// The collaborators reconciliation needs, borrowed from one migration.
pub struct Collaborators<'a> {
    pub source: &'a mut dyn SourceProvider,
    pub mapping: &'a mut dyn MappingStore,
    pub storage: &'a mut dyn DestinationStorage,
}

pub trait Migration {
    fn id(&self) -> &str;

    fn label(&self) -> &str;

    fn status(&self) -> MigrationStatus;

    fn set_status(&mut self, status: MigrationStatus);

    /// Flag the migration as interrupted with `result`.
    fn interrupt(&mut self, result: ImportResult);

    /// Ids of migrations that must complete before this one starts.
    fn required_dependencies(&self) -> Vec<String>;

    /// Configured orphan action, unparsed.
    fn orphan_action(&self) -> &str;

    fn source_count(&mut self) -> Result<usize, ReconError>;

    /// Start a fresh import run from the top of the source.
    fn start_run(&mut self) -> Result<(), ReconError>;

    /// Import up to `limit` rows. Row-level failures are counted, never raised.
    fn import(&mut self, limit: usize) -> (ImportResult, ImportCounts);

    fn collaborators(&mut self) -> Collaborators<'_>;
}

pub trait MigrationRegistry {
    fn migration_mut(&mut self, id: &str) -> Option<&mut dyn Migration>;

    fn migration(&self, id: &str) -> Option<&dyn Migration>;
}

#[derive(Default)]
pub struct MemoryRegistry {
    migrations: BTreeMap<String, Box<dyn Migration>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, migration: Box<dyn Migration>) {
        self.migrations.insert(migration.id().to_string(), migration);
    }
}

impl MigrationRegistry for MemoryRegistry {
    fn migration_mut(&mut self, id: &str) -> Option<&mut dyn Migration> {
        match self.migrations.get_mut(id) {
            Some(m) => Some(m.as_mut()),
            None => None,
        }
    }

    fn migration(&self, id: &str) -> Option<&dyn Migration> {
        self.migrations.get(id).map(|m| m.as_ref())
    }
}
