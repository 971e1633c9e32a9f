//! Source providers: where the current run's rows and identity keys come from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::ReconError;
use crate::identity::IdentityKey;

/// One source row, column name → value.
pub type SourceRow = BTreeMap<String, Value>;

pub trait SourceProvider {
    /// Number of rows in the current source.
    fn count(&mut self) -> Result<usize, ReconError>;

    /// Every identity key currently present, in source order. Must return the
    /// live set on every call.
    fn all_current_identity_keys(&mut self) -> Result<Vec<IdentityKey>, ReconError>;

    /// Every row currently present, in source order.
    fn rows(&mut self) -> Result<Vec<SourceRow>, ReconError>;
}

/// Collect keys from rows, skipping rows without a complete key.
fn keys_of(rows: &[SourceRow], id_fields: &[String]) -> Vec<IdentityKey> {
    rows.iter()
        .filter_map(|row| IdentityKey::from_row(row, id_fields))
        .collect()
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub id_fields: Vec<String>,
    pub rows: Vec<SourceRow>,
}

impl MemorySource {
    pub fn new(id_fields: Vec<String>, rows: Vec<SourceRow>) -> Self {
        Self { id_fields, rows }
    }
}

impl SourceProvider for MemorySource {
    fn count(&mut self) -> Result<usize, ReconError> {
        Ok(self.rows.len())
    }

    fn all_current_identity_keys(&mut self) -> Result<Vec<IdentityKey>, ReconError> {
        Ok(keys_of(&self.rows, &self.id_fields))
    }

    fn rows(&mut self) -> Result<Vec<SourceRow>, ReconError> {
        Ok(self.rows.clone())
    }
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

/// CSV file with a header row. Re-read on every call so edits to the file
/// between runs are always visible.
#[derive(Debug, Clone)]
pub struct CsvSource {
    migration_id: String,
    path: PathBuf,
    id_fields: Vec<String>,
}

impl CsvSource {
    pub fn new(migration_id: &str, path: impl Into<PathBuf>, id_fields: Vec<String>) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            path: path.into(),
            id_fields,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn source_err(&self, message: impl Into<String>) -> ReconError {
        ReconError::Source {
            migration: self.migration_id.clone(),
            message: message.into(),
        }
    }

    fn read(&self) -> Result<Vec<SourceRow>, ReconError> {
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| self.source_err(format!("cannot read {}: {e}", self.path.display())))?;
        let rows = parse_csv_rows(&data)?;
        if let Some(first) = rows.first() {
            if let Some(missing) = self.id_fields.iter().find(|f| !first.contains_key(*f)) {
                return Err(self.source_err(format!("missing id column '{missing}'")));
            }
        }
        Ok(rows)
    }
}

impl SourceProvider for CsvSource {
    fn count(&mut self) -> Result<usize, ReconError> {
        Ok(self.read()?.len())
    }

    fn all_current_identity_keys(&mut self) -> Result<Vec<IdentityKey>, ReconError> {
        Ok(keys_of(&self.read()?, &self.id_fields))
    }

    fn rows(&mut self) -> Result<Vec<SourceRow>, ReconError> {
        self.read()
    }
}

/// Parse CSV text into rows keyed by header. Cells are kept as strings.
pub fn parse_csv_rows(csv_data: &str) -> Result<Vec<SourceRow>, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = SourceRow::new();
        for (i, h) in headers.iter().enumerate() {
            if let Some(val) = record.get(i) {
                row.insert(h.clone(), Value::String(val.to_string()));
            }
        }
        rows.push(row);
    }
    Ok(rows)
}
