//! Destination entities and the storage they live in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReconError;
use crate::identity::IdentityValue;

/// Field that carries the audit message of a new revision, when present.
pub const REVISION_LOG_FIELD: &str = "revision_log";

// ---------------------------------------------------------------------------
// Entity type
// ---------------------------------------------------------------------------

/// Destination type definition: which keys carry publish status and label,
/// and whether saves can create revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityType {
    pub id: String,
    #[serde(default)]
    pub status_key: Option<String>,
    #[serde(default)]
    pub label_key: Option<String>,
    #[serde(default)]
    pub revisionable: bool,
}

impl EntityType {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status_key: None,
            label_key: None,
            revisionable: false,
        }
    }

    pub fn with_status_key(mut self, key: &str) -> Self {
        self.status_key = Some(key.to_string());
        self
    }

    pub fn with_label_key(mut self, key: &str) -> Self {
        self.label_key = Some(key.to_string());
        self
    }

    pub fn revisionable(mut self) -> Self {
        self.revisionable = true;
        self
    }

    /// Human-readable label: the label field when it holds a non-empty string,
    /// otherwise `"{type} {id}"`.
    pub fn label(&self, entity: &Entity) -> String {
        if let Some(Value::String(s)) = self.label_key.as_deref().and_then(|k| entity.get(k)) {
            if !s.is_empty() {
                return s.clone();
            }
        }
        match &entity.id {
            Some(id) => format!("{} {id}", self.id),
            None => format!("{} (unsaved)", self.id),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(default)]
    pub id: Option<IdentityValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<u64>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(skip)]
    new_revision: bool,
}

impl Entity {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) -> &mut Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Ask the next save to create a new revision. Ignored by storages whose
    /// type is not revisionable.
    pub fn set_new_revision(&mut self) {
        self.new_revision = true;
    }

    /// Whether `field` holds a truthy value: `true`, a non-zero number, or a
    /// non-empty string other than `"0"`.
    pub fn is_truthy(&self, field: &str) -> bool {
        match self.get(field) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Some(Value::String(s)) => !s.is_empty() && s != "0",
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(Value::Null) | None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

pub trait DestinationStorage {
    fn entity_type(&self) -> &EntityType;

    fn load(&self, id: &IdentityValue) -> Result<Option<Entity>, ReconError>;

    /// Persist `entity`. New entities (no id) get the next serial id.
    fn save(&mut self, entity: &mut Entity) -> Result<(), ReconError>;

    fn delete(&mut self, entity: Entity) -> Result<(), ReconError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serial-id storage held in memory; serializable so callers can persist it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStorage {
    entity_type: EntityType,
    #[serde(default)]
    entities: BTreeMap<i64, Entity>,
    #[serde(default)]
    next_id: i64,
    #[serde(default)]
    next_revision: u64,
}

impl MemoryStorage {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            entities: BTreeMap::new(),
            next_id: 1,
            next_revision: 1,
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Replace the type definition, e.g. after the manifest changed.
    pub fn set_entity_type(&mut self, entity_type: EntityType) {
        self.entity_type = entity_type;
    }

    fn storage_err(&self, message: impl Into<String>) -> ReconError {
        ReconError::Storage {
            entity_type: self.entity_type.id.clone(),
            message: message.into(),
        }
    }
}

impl DestinationStorage for MemoryStorage {
    fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    fn load(&self, id: &IdentityValue) -> Result<Option<Entity>, ReconError> {
        match id {
            IdentityValue::Int(i) => Ok(self.entities.get(i).cloned()),
            IdentityValue::Str(s) => Ok(s.parse::<i64>().ok().and_then(|i| self.entities.get(&i).cloned())),
            IdentityValue::Null | IdentityValue::Bool(_) => Ok(None),
        }
    }

    fn save(&mut self, entity: &mut Entity) -> Result<(), ReconError> {
        let id = match &entity.id {
            Some(IdentityValue::Int(i)) => *i,
            Some(other) => return Err(self.storage_err(format!("non-serial id {other}"))),
            None => {
                let id = self.next_id.max(1);
                entity.id = Some(IdentityValue::Int(id));
                id
            }
        };
        self.next_id = self.next_id.max(id + 1);

        if self.entity_type.revisionable && (entity.revision_id.is_none() || entity.new_revision) {
            let rev = self.next_revision.max(1);
            entity.revision_id = Some(rev);
            self.next_revision = rev + 1;
        }
        entity.new_revision = false;

        self.entities.insert(id, entity.clone());
        Ok(())
    }

    fn delete(&mut self, entity: Entity) -> Result<(), ReconError> {
        if let Some(IdentityValue::Int(id)) = entity.id {
            self.entities.remove(&id);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.entities.len()
    }
}
