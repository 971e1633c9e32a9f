// Global settings
// Loaded from ~/.config/mrecon/settings.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Batch import
    #[serde(rename = "batch.limit")]
    pub batch_limit: usize,

    #[serde(rename = "batch.itemLimit", skip_serializing_if = "Option::is_none")]
    pub item_limit: Option<usize>,

    // Reconciliation
    #[serde(rename = "reconcile.guardTtlSecs")]
    pub guard_ttl_secs: u64,

    // State
    #[serde(rename = "state.dir", skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>, // None = platform data dir
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_limit: 15,
            item_limit: None,
            guard_ttl_secs: 305,
            state_dir: None,
        }
    }
}

impl Settings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mrecon")
            .join("settings.json")
    }

    /// Load settings from the default path, falling back to defaults
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load settings from `path`. A missing file yields defaults; an
    /// unreadable or malformed one is reported and also yields defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    eprintln!("Error parsing {}: {}", path.display(), e);
                    eprintln!("Using default settings");
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Error reading {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parse settings JSON. Lines starting with `//` are comments.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let cleaned: String = contents
            .lines()
            .filter(|line| !line.trim().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");
        serde_json::from_str(&cleaned).map_err(|e| e.to_string())
    }

    /// Where mapping tables, the guard cache and destination content live.
    pub fn effective_state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mrecon"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.batch_limit, 15);
        assert_eq!(s.guard_ttl_secs, 305);
        assert!(s.state_dir.is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let s = Settings::parse(
            r#"{
    // smaller batches on shared hosting
    "batch.limit": 5
}"#,
        )
        .unwrap();
        assert_eq!(s.batch_limit, 5);
        assert_eq!(s.guard_ttl_secs, 305);
    }

    #[test]
    fn malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
        assert_eq!(Settings::load_from(&dir.path().join("missing.json")), Settings::default());
    }

    #[test]
    fn written_settings_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let s = Settings {
            batch_limit: 50,
            state_dir: Some(dir.path().join("state")),
            ..Settings::default()
        };
        let raw = serde_json::to_string_pretty(&s).unwrap();
        assert!(raw.contains("\"batch.limit\": 50"));
        fs::write(&path, raw).unwrap();

        assert_eq!(Settings::load_from(&path), s);
        assert_eq!(s.effective_state_dir(), dir.path().join("state"));
    }
}
