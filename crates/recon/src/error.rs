use std::fmt;

#[derive(Debug)]
pub enum ReconError {
    /// TOML / JSON parse or deserialization error.
    ConfigParse(String),
    /// Config validation error (missing id fields, bad dependency, etc.).
    ConfigValidation(String),
    /// Configured orphan action is not one of "", "delete", "unpublish".
    UnknownOrphanAction(String),
    /// A migration id that the registry does not know.
    UnknownMigration(String),
    /// Source provider failure (unreadable file, missing id column).
    Source { migration: String, message: String },
    /// Destination storage failure (load/save/delete).
    Storage { entity_type: String, message: String },
    /// Mapping store failure.
    Mapping(String),
    /// IO error (file read, etc.).
    Io(String),
}

impl fmt::Display for ReconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::ConfigValidation(msg) => write!(f, "config validation error: {msg}"),
            Self::UnknownOrphanAction(action) => {
                write!(f, "unknown orphan action '{action}' (expected \"delete\" or \"unpublish\")")
            }
            Self::UnknownMigration(id) => write!(f, "unknown migration: {id}"),
            Self::Source { migration, message } => {
                write!(f, "migration '{migration}': source error: {message}")
            }
            Self::Storage { entity_type, message } => {
                write!(f, "{entity_type} storage error: {message}")
            }
            Self::Mapping(msg) => write!(f, "mapping store error: {msg}"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for ReconError {}

impl From<rusqlite::Error> for ReconError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Mapping(e.to_string())
    }
}

impl From<csv::Error> for ReconError {
    fn from(e: csv::Error) -> Self {
        Self::Io(e.to_string())
    }
}
