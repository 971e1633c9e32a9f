// Configuration loading

pub mod manifest;
pub mod settings;

pub use manifest::{Manifest, ManifestError, MigrationConfig};
pub use settings::Settings;
