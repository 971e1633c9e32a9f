//! SQLite-backed mapping store and run-guard cache.
//!
//! Map tables follow the `migrate_map_<id>` layout: one row per source key,
//! keyed by a SHA-256 of the JSON-encoded key, with one `destidN` column per
//! destination id field.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use crate::error::ReconError;
use crate::guard::{GuardCache, GuardToken};
use crate::identity::{DestinationId, IdentityKey, IdentityValue};
use crate::mapping::{MappingRecord, MappingStatus, MappingStore};

const GUARD_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_reconcile (
    cid TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    expire INTEGER NOT NULL
);
"#;

/// `migrate_map_` + the migration id with anything outside `[A-Za-z0-9_]`
/// replaced by `_`.
pub fn map_table_name(migration_id: &str) -> String {
    let clean: String = migration_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("migrate_map_{clean}")
}

/// Hex SHA-256 of the JSON encoding of `key`.
pub fn source_ids_hash(key: &IdentityKey) -> String {
    let encoded = serde_json::to_string(key).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn to_sql(v: &IdentityValue) -> SqlValue {
    match v {
        IdentityValue::Null => SqlValue::Null,
        IdentityValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        IdentityValue::Int(i) => SqlValue::Integer(*i),
        IdentityValue::Str(s) => SqlValue::Text(s.clone()),
    }
}

fn from_sql(v: SqlValue) -> IdentityValue {
    match v {
        SqlValue::Null | SqlValue::Blob(_) => IdentityValue::Null,
        SqlValue::Integer(i) => IdentityValue::Int(i),
        SqlValue::Real(f) => IdentityValue::Str(f.to_string()),
        SqlValue::Text(s) => IdentityValue::Str(s),
    }
}

// ---------------------------------------------------------------------------
// Mapping store
// ---------------------------------------------------------------------------

pub struct SqlMappingStore {
    conn: Connection,
    table: String,
    destination_fields: Vec<String>,
    rows: Vec<MappingRecord>,
    cursor: usize,
}

impl SqlMappingStore {
    pub fn open(path: &Path, migration_id: &str, destination_fields: Vec<String>) -> Result<Self, ReconError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, migration_id, destination_fields)
    }

    pub fn from_connection(
        conn: Connection,
        migration_id: &str,
        destination_fields: Vec<String>,
    ) -> Result<Self, ReconError> {
        if destination_fields.is_empty() {
            return Err(ReconError::ConfigValidation(format!(
                "migration '{migration_id}': at least one destination id field is required"
            )));
        }
        let store = Self {
            conn,
            table: map_table_name(migration_id),
            destination_fields,
            rows: Vec::new(),
            cursor: 0,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn ensure_schema(&self) -> Result<(), ReconError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                source_ids_hash TEXT PRIMARY KEY,
                source_ids TEXT NOT NULL,
                source_row_status INTEGER NOT NULL DEFAULT 0,
                hash TEXT,
                last_imported INTEGER NOT NULL DEFAULT 0
            );",
            t = self.table
        ))?;

        // Destination columns are added on demand so a widened destination key
        // does not require a rebuilt table.
        let existing: HashSet<String> = {
            let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", self.table))?;
            let cols = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<_, _>>()?;
            cols
        };
        for col in self.dest_columns() {
            if !existing.contains(&col) {
                self.conn
                    .execute(&format!("ALTER TABLE {} ADD COLUMN {col}", self.table), [])?;
            }
        }
        Ok(())
    }

    fn dest_columns(&self) -> Vec<String> {
        (1..=self.destination_fields.len()).map(|i| format!("destid{i}")).collect()
    }

    fn select_columns(&self) -> String {
        let mut cols = vec!["source_ids".to_string(), "source_row_status".into(), "hash".into()];
        cols.extend(self.dest_columns());
        cols.join(", ")
    }

    fn read_record(&self, row: &Row<'_>) -> rusqlite::Result<MappingRecord> {
        let source_ids: String = row.get(0)?;
        let status: i64 = row.get(1)?;
        let hash: Option<String> = row.get(2)?;

        let mut parts = Vec::with_capacity(self.destination_fields.len());
        for i in 0..self.destination_fields.len() {
            parts.push(from_sql(row.get::<_, SqlValue>(3 + i)?));
        }
        let destination = if parts.iter().all(|p| *p == IdentityValue::Null) {
            None
        } else if parts.len() == 1 {
            parts.pop().map(DestinationId::Scalar)
        } else {
            Some(DestinationId::Composite(parts.into_iter().map(DestinationId::Scalar).collect()))
        };

        let source_key: IdentityKey = serde_json::from_str(&source_ids).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(MappingRecord {
            source_key,
            destination,
            status: MappingStatus::from_code(status).unwrap_or(MappingStatus::Failed),
            hash,
        })
    }
}

impl MappingStore for SqlMappingStore {
    fn rewind(&mut self) -> Result<(), ReconError> {
        let sql = format!("SELECT {} FROM {} ORDER BY rowid", self.select_columns(), self.table);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| self.read_record(row))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        self.rows = rows;
        self.cursor = 0;
        Ok(())
    }

    fn current(&self) -> Option<&MappingRecord> {
        self.rows.get(self.cursor)
    }

    fn advance(&mut self) {
        if self.cursor < self.rows.len() {
            self.cursor += 1;
        }
    }

    fn resolve_destination_id(&self, key: &IdentityKey) -> Result<Option<DestinationId>, ReconError> {
        Ok(self.lookup(key)?.and_then(|r| r.destination))
    }

    fn lookup(&self, key: &IdentityKey) -> Result<Option<MappingRecord>, ReconError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE source_ids_hash = ?1",
            self.select_columns(),
            self.table
        );
        let record = self
            .conn
            .query_row(&sql, params![source_ids_hash(key)], |row| self.read_record(row))
            .optional()?;
        Ok(record)
    }

    fn save_mapping(&mut self, record: MappingRecord) -> Result<(), ReconError> {
        let source_ids =
            serde_json::to_string(&record.source_key).map_err(|e| ReconError::Mapping(e.to_string()))?;

        let mut parts: Vec<IdentityValue> = record.destination.map(|d| d.components()).unwrap_or_default();
        if parts.len() > self.destination_fields.len() {
            log::warn!(
                "{}: destination id has {} components, only {} stored",
                self.table,
                parts.len(),
                self.destination_fields.len()
            );
        }
        parts.resize(self.destination_fields.len(), IdentityValue::Null);

        let dest_cols = self.dest_columns();
        let mut cols = vec!["source_ids_hash", "source_ids", "source_row_status", "hash", "last_imported"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        cols.extend(dest_cols.iter().cloned());
        let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = cols
            .iter()
            .skip(1)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(source_ids_hash) DO UPDATE SET {}",
            self.table,
            cols.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        );

        let mut values = vec![
            SqlValue::Text(source_ids_hash(&record.source_key)),
            SqlValue::Text(source_ids),
            SqlValue::Integer(record.status.code()),
            record.hash.map(SqlValue::Text).unwrap_or(SqlValue::Null),
            SqlValue::Integer(Utc::now().timestamp()),
        ];
        values.extend(parts.iter().map(to_sql));

        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn row_by_destination(
        &self,
        values: &BTreeMap<String, IdentityValue>,
    ) -> Result<Option<MappingRecord>, ReconError> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        for (i, field) in self.destination_fields.iter().enumerate() {
            let Some(value) = values.get(field) else { continue };
            params.push(to_sql(value));
            conditions.push(format!("destid{} = ?{}", i + 1, params.len()));
        }
        if conditions.is_empty() {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY rowid LIMIT 1",
            self.select_columns(),
            self.table,
            conditions.join(" AND ")
        );
        let record = self
            .conn
            .query_row(&sql, params_from_iter(params), |row| self.read_record(row))
            .optional()?;
        Ok(record)
    }

    fn len(&self) -> Result<usize, ReconError> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn destroy(&mut self) -> Result<(), ReconError> {
        self.conn.execute(&format!("DELETE FROM {}", self.table), [])?;
        self.rows.clear();
        self.cursor = 0;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Guard cache
// ---------------------------------------------------------------------------

/// Guard cache in a `cache_reconcile` table, so separate processes within the
/// window see each other's runs.
pub struct SqlGuardCache {
    conn: Connection,
}

impl SqlGuardCache {
    pub fn open(path: &Path) -> Result<Self, ReconError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, ReconError> {
        conn.execute_batch(GUARD_SCHEMA)?;
        Ok(Self { conn })
    }
}

impl GuardCache for SqlGuardCache {
    fn get(&self, cid: &str, now: DateTime<Utc>) -> Result<Option<GuardToken>, ReconError> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT data, expire FROM cache_reconcile WHERE cid = ?1",
                params![cid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((data, expire)) if now.timestamp() < expire => {
                let token = serde_json::from_str(&data).map_err(|e| ReconError::Mapping(e.to_string()))?;
                Ok(Some(token))
            }
            Some(_) => {
                self.delete(cid)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, cid: &str, token: &GuardToken) -> Result<(), ReconError> {
        let data = serde_json::to_string(token).map_err(|e| ReconError::Mapping(e.to_string()))?;
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_reconcile (cid, data, expire) VALUES (?1, ?2, ?3)",
            params![cid, data, token.expires_at().timestamp()],
        )?;
        Ok(())
    }

    fn delete(&self, cid: &str) -> Result<(), ReconError> {
        self.conn
            .execute("DELETE FROM cache_reconcile WHERE cid = ?1", params![cid])?;
        Ok(())
    }
}
