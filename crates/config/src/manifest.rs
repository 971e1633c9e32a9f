// Migration manifest
// A TOML file with one [migrations.<id>] table per migration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    Io(String),
    Parse(String),
    Invalid { migration: String, message: String },
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::Io(msg) => write!(f, "cannot read manifest: {msg}"),
            ManifestError::Parse(msg) => write!(f, "manifest parse error: {msg}"),
            ManifestError::Invalid { migration, message } => {
                write!(f, "migration '{migration}': {message}")
            }
        }
    }
}

impl std::error::Error for ManifestError {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub migrations: BTreeMap<String, MigrationConfig>,

    /// Directory relative source paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// Disabled migrations are hidden from listings and cannot run.
    #[serde(default = "default_true")]
    pub status: bool,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    /// destination field = "source column"
    #[serde(default)]
    pub process: BTreeMap<String, String>,
    #[serde(default)]
    pub migration_dependencies: Dependencies,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub plugin: String,
    pub path: PathBuf,
    pub ids: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    /// "delete", "unpublish", or empty. Parsed at run time.
    #[serde(default)]
    pub orphan_action: String,
    #[serde(default = "default_true")]
    pub track_changes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub selector: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// "entity:<type>"
    pub plugin: String,
    #[serde(default)]
    pub status_key: Option<String>,
    #[serde(default)]
    pub label_key: Option<String>,
    #[serde(default)]
    pub revisionable: bool,
    #[serde(default = "default_destination_ids")]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default)]
    pub required: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_destination_ids() -> Vec<String> {
    vec!["id".to_string()]
}

impl Manifest {
    /// Parse and validate manifest TOML.
    pub fn from_toml(s: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(s).map_err(|e| ManifestError::Parse(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load from disk; relative source paths resolve against the file's
    /// directory.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ManifestError::Io(format!("{}: {e}", path.display())))?;
        let mut manifest = Self::from_toml(&contents)?;
        manifest.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        for (id, m) in &self.migrations {
            let invalid = |message: String| ManifestError::Invalid {
                migration: id.clone(),
                message,
            };

            if m.source.plugin != "csv" {
                return Err(invalid(format!("unsupported source plugin '{}'", m.source.plugin)));
            }
            if m.source.ids.is_empty() {
                return Err(invalid("source.ids must name at least one column".into()));
            }
            if m.destination.entity_type().is_none() {
                return Err(invalid(format!(
                    "destination plugin '{}' must look like 'entity:<type>'",
                    m.destination.plugin
                )));
            }
            if m.destination.ids.is_empty() {
                return Err(invalid("destination.ids must name at least one field".into()));
            }
            for dep in &m.migration_dependencies.required {
                if !self.migrations.contains_key(dep) {
                    return Err(invalid(format!("unknown required dependency '{dep}'")));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&MigrationConfig> {
        self.migrations.get(id)
    }

    /// Enabled migrations, by id.
    pub fn enabled(&self) -> impl Iterator<Item = (&str, &MigrationConfig)> {
        self.migrations
            .iter()
            .filter(|(_, m)| m.status)
            .map(|(id, m)| (id.as_str(), m))
    }

    /// Enabled migrations grouped by `group`; ungrouped ones go under
    /// [`DEFAULT_GROUP`].
    pub fn groups(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, m) in self.enabled() {
            groups.entry(m.group.as_deref().unwrap_or(DEFAULT_GROUP)).or_default().push(id);
        }
        groups
    }

    pub fn source_path(&self, m: &MigrationConfig) -> PathBuf {
        if m.source.path.is_absolute() {
            m.source.path.clone()
        } else {
            self.base_dir.join(&m.source.path)
        }
    }
}

impl MigrationConfig {
    pub fn label_or<'a>(&'a self, id: &'a str) -> &'a str {
        self.label.as_deref().unwrap_or(id)
    }

    /// Header row for a blank CSV: `"selector (label)"` per configured
    /// field, commas removed.
    pub fn csv_template_header(&self) -> Vec<String> {
        self.source
            .fields
            .iter()
            .map(|f| format!("{} ({})", f.selector, f.label).replace(',', ""))
            .collect()
    }
}

impl DestinationConfig {
    /// The `<type>` of `entity:<type>`.
    pub fn entity_type(&self) -> Option<&str> {
        self.plugin
            .strip_prefix("entity:")
            .filter(|t| !t.is_empty())
    }
}
