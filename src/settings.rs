//! Settings persistence
//!
//! Saves and loads the user-editable bridge settings to/from a JSON file.
//! Loading merges defaults underneath the stored values: keys missing from
//! the file get their default, keys present in the file are kept.

use crate::config::{BridgeConfig, TransportMode, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SETTINGS_VERSION: u32 = 1;

/// Error types for settings persistence
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// File I/O error
    #[error("IO Error: {0}")]
    Io(String),
    /// JSON serialization/deserialization error
    #[error("JSON Error: {0}")]
    Json(String),
    /// Invalid data format
    #[error("Invalid Data: {0}")]
    InvalidData(String),
}

/// User-editable settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Whether the bridge is enabled
    pub enabled: bool,
    /// Port of the external endpoint
    pub port: u16,
    /// Transport mode
    pub mode: TransportMode,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_PORT,
            mode: TransportMode::ClientSocket,
        }
    }
}

impl BridgeSettings {
    /// Settings as currently held in `config`
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            enabled: config.enabled,
            port: config.port,
            mode: config.transport_mode,
        }
    }

    /// `base` with these settings applied
    pub fn apply_to(&self, base: &BridgeConfig) -> BridgeConfig {
        BridgeConfig {
            enabled: self.enabled,
            port: self.port,
            transport_mode: self.mode,
            ..base.clone()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsFile {
    /// Version of the file format (for future migration support)
    version: u32,
    settings: Value,
}

/// Opaque load/save capability for bridge settings
pub trait SettingsStore {
    /// Load settings, falling back to defaults for anything missing
    fn load(&self) -> Result<BridgeSettings, SettingsError>;

    /// Persist settings
    fn save(&self, settings: &BridgeSettings) -> Result<(), SettingsError>;
}

/// Settings stored in a JSON file
#[derive(Debug, Clone)]
pub struct JsonFileSettings {
    path: PathBuf,
}

impl JsonFileSettings {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettings {
    fn load(&self) -> Result<BridgeSettings, SettingsError> {
        if !self.path.exists() {
            return Ok(BridgeSettings::default());
        }

        let json = fs::read_to_string(&self.path).map_err(|e| SettingsError::Io(e.to_string()))?;
        let file: SettingsFile =
            serde_json::from_str(&json).map_err(|e| SettingsError::Json(e.to_string()))?;

        if file.version != SETTINGS_VERSION {
            return Err(SettingsError::InvalidData(format!(
                "Unsupported settings version: {}",
                file.version
            )));
        }

        let Value::Object(stored) = file.settings else {
            return Err(SettingsError::InvalidData(
                "settings must be a JSON object".to_string(),
            ));
        };
        let merged = merge_defaults(stored, &BridgeSettings::default())?;
        serde_json::from_value(Value::Object(merged)).map_err(|e| SettingsError::Json(e.to_string()))
    }

    fn save(&self, settings: &BridgeSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| SettingsError::Io(e.to_string()))?;
            }
        }

        let file = SettingsFile {
            version: SETTINGS_VERSION,
            settings: serde_json::to_value(settings)
                .map_err(|e| SettingsError::Json(e.to_string()))?,
        };
        let json =
            serde_json::to_string_pretty(&file).map_err(|e| SettingsError::Json(e.to_string()))?;
        fs::write(&self.path, json).map_err(|e| SettingsError::Io(e.to_string()))
    }
}

/// Fill keys missing from `stored` with values from `defaults`
pub fn merge_defaults(
    mut stored: Map<String, Value>,
    defaults: &BridgeSettings,
) -> Result<Map<String, Value>, SettingsError> {
    let Value::Object(defaults) =
        serde_json::to_value(defaults).map_err(|e| SettingsError::Json(e.to_string()))?
    else {
        return Err(SettingsError::InvalidData(
            "defaults are not an object".to_string(),
        ));
    };

    for (key, value) in defaults {
        stored.entry(key).or_insert(value);
    }
    Ok(stored)
}
