//! What happens to the destination entity of an orphaned mapping record.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{DestinationStorage, Entity, REVISION_LOG_FIELD};
use crate::error::ReconError;

pub const UNPUBLISH_REVISION_LOG: &str = "Unpublished content since it no longer exists in the source data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanAction {
    #[default]
    None,
    Delete,
    Unpublish,
}

impl FromStr for OrphanAction {
    type Err = ReconError;

    /// Parse the configured value. Empty means no action.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "delete" => Ok(Self::Delete),
            "unpublish" => Ok(Self::Unpublish),
            _ => Err(ReconError::UnknownOrphanAction(s.to_string())),
        }
    }
}

impl std::fmt::Display for OrphanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Delete => write!(f, "delete"),
            Self::Unpublish => write!(f, "unpublish"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionOutcome {
    Applied,
    /// Nothing to do: already unpublished, no publish status, or no action.
    Skipped,
}

/// Audit record for one applied disposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditNotice {
    pub action: OrphanAction,
    pub migration: String,
    pub entity_type: String,
    pub label: String,
}

impl std::fmt::Display for AuditNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self.action {
            OrphanAction::Delete => "Deleted",
            OrphanAction::Unpublish => "Unpublished",
            OrphanAction::None => "Kept",
        };
        write!(
            f,
            "{verb} entity since it no longer exists in the source data. Migration: {}, Entity Type: {}, Label: {}",
            self.migration, self.entity_type, self.label
        )
    }
}

impl OrphanAction {
    /// Apply this action to `entity`. On `Applied` the returned notice has
    /// already been logged on the `migrate_recon::audit` target.
    pub fn apply(
        self,
        mut entity: Entity,
        storage: &mut dyn DestinationStorage,
        migration_label: &str,
    ) -> Result<(DispositionOutcome, Option<AuditNotice>), ReconError> {
        let entity_type = storage.entity_type().clone();
        let label = entity_type.label(&entity);

        match self {
            Self::None => return Ok((DispositionOutcome::Skipped, None)),
            Self::Delete => {
                storage.delete(entity)?;
            }
            Self::Unpublish => {
                let Some(status_key) = entity_type.status_key.as_deref() else {
                    return Ok((DispositionOutcome::Skipped, None));
                };
                if !entity.has_field(status_key) || !entity.is_truthy(status_key) {
                    return Ok((DispositionOutcome::Skipped, None));
                }

                if entity_type.revisionable {
                    entity.set_new_revision();
                }
                if entity.has_field(REVISION_LOG_FIELD) {
                    entity.set(REVISION_LOG_FIELD, Value::String(UNPUBLISH_REVISION_LOG.into()));
                }
                entity.set(status_key, Value::from(0));
                storage.save(&mut entity)?;
            }
        }

        let notice = AuditNotice {
            action: self,
            migration: migration_label.to_string(),
            entity_type: entity_type.id,
            label,
        };
        log::info!(target: "migrate_recon::audit", "{notice}");
        Ok((DispositionOutcome::Applied, Some(notice)))
    }
}
