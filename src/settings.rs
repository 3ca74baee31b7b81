use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::{ResilienceError, Result};

pub const FAILOVER_SILENCE_THRESHOLD_KEY: &str = "redundancy.failover_silence_threshold_secs";
pub const FAILOVER_COOLDOWN_KEY: &str = "redundancy.failover_cooldown_secs";
pub const FAILBACK_STABILIZATION_PERIOD_KEY: &str = "redundancy.failback_stabilization_period_secs";

/// Persisted key-value settings.
///
/// Backed by a pretty-printed JSON object on disk. A missing file starts
/// empty; an unparseable one is logged and treated as empty so a corrupt
/// file never blocks a recording session.
#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    settings_path: Option<PathBuf>,
    values: Map<String, Value>,
}

impl SettingsStore {
    /// Open the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let settings_path = path.as_ref().to_path_buf();

        let values = match fs::read_to_string(&settings_path) {
            Ok(contents) => match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(values) => values,
                Err(e) => {
                    error!(
                        "Failed to parse {}: {}, using defaults",
                        settings_path.display(),
                        e
                    );
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, starting empty", settings_path.display());
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            settings_path: Some(settings_path),
            values,
        })
    }

    /// Store that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.settings_path.as_deref()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                error!("Ignoring setting {} with unexpected value {}: {}", key, value, e);
                None
            }
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get::<f64>(key)
    }

    /// Set a value and persist the store
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.values.insert(key.to_string(), value);
        self.save()
    }

    /// Remove a value and persist the store, returning whether it existed
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let existed = self.values.remove(key).is_some();
        if existed {
            self.save()?;
        }
        Ok(existed)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.settings_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(&self.values)?;
        fs::write(path, json).map_err(|e| ResilienceError::Settings {
            message: format!("Failed to save settings to {}: {}", path.display(), e),
        })
    }

    /// Re-read the backing file, replacing in-memory values
    pub fn reload(&mut self) -> Result<()> {
        let Some(path) = &self.settings_path else {
            return Ok(());
        };

        let contents = fs::read_to_string(path)?;
        self.values = serde_json::from_str(&contents)?;
        Ok(())
    }
}
