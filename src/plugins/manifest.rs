// Plugin manifest schema and validation
//
// Each plugin directory carries a manifest.json describing the handler the
// host should bind and how to schedule it. Unknown fields round-trip
// through `extra` but are otherwise ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_PRIORITY: i32 = 50;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    /// Semver, validated on load
    pub version: String,
    /// Names the compiled-in handler to bind
    pub main: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 0-100; higher dispatches earlier
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub config: Value,
    /// Unknown manifest fields, preserved but ignored
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest has no name")]
    MissingName,
    #[error("manifest for {0} has no main handler")]
    MissingMain(String),
    #[error("manifest for {0} has invalid version {1:?}: {2}")]
    InvalidVersion(String, String, semver::Error),
    #[error("manifest for {0} has priority {1} outside 0-100")]
    PriorityOutOfRange(String, i32),
    #[error("reading manifest at {0}: {1}")]
    Unreadable(String, String),
}

impl PluginManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::MissingName);
        }
        if self.main.trim().is_empty() {
            return Err(ManifestError::MissingMain(self.name.clone()));
        }
        if let Err(err) = semver::Version::parse(&self.version) {
            return Err(ManifestError::InvalidVersion(
                self.name.clone(),
                self.version.clone(),
                err,
            ));
        }
        if !(0..=100).contains(&self.priority) {
            return Err(ManifestError::PriorityOutOfRange(
                self.name.clone(),
                self.priority,
            ));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::Unreadable(path.display().to_string(), e.to_string()))?;
        let manifest: PluginManifest = serde_json::from_str(&text)
            .map_err(|e| ManifestError::Unreadable(path.display().to_string(), e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }
}
