//! `migrate-recon`: orphan reconciliation and batched import for content
//! migrations.
//!
//! After an import completes, destination records whose source rows have
//! disappeared are deleted or unpublished, at most once per guard window.
//! Imports run in small resumable steps, dependencies first.

pub mod batch;
pub mod disposition;
pub mod entity;
pub mod error;
pub mod executable;
pub mod guard;
pub mod identity;
pub mod mapping;
pub mod migration;
pub mod reconcile;
pub mod source;
pub mod sql;

pub use batch::{BatchDriver, BatchOptions, BatchSummary, StepResult, DEFAULT_BATCH_LIMIT};
pub use disposition::{AuditNotice, DispositionOutcome, OrphanAction};
pub use entity::{DestinationStorage, Entity, EntityType, MemoryStorage};
pub use error::ReconError;
pub use executable::RowMigration;
pub use guard::{RunGuard, DEFAULT_GUARD_TTL_SECS};
pub use identity::{DestinationId, IdentityKey, IdentityValue};
pub use mapping::{MappingRecord, MappingStatus, MappingStore, MemoryMappingStore};
pub use migration::{ImportResult, MemoryRegistry, Migration, MigrationRegistry, MigrationStatus};
pub use reconcile::{MigrationRef, PassStatus, ReconcileReport, Reconciler};
pub use source::{CsvSource, MemorySource, SourceProvider, SourceRow};
pub use sql::{SqlGuardCache, SqlMappingStore};
