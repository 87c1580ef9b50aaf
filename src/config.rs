use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
/// Persisted engine tunables for an editing session.
pub struct EngineConfig {
    /// Undo depth for the mask and curve histories.
    pub history_capacity: usize,
    /// Minimum interval between blend dispatches while dragging.
    pub throttle_interval_ms: u64,
    /// Default brush hardness in [0, 1]; 1.0 stamps a crisp square.
    pub brush_hardness: f32,
    /// Downscale factor of the live stroke preview raster.
    pub preview_downscale: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: crate::history::DEFAULT_CAPACITY,
            throttle_interval_ms: 80,
            brush_hardness: 0.5,
            preview_downscale: 4,
        }
    }
}

impl EngineConfig {
    /// Returns the user config file path, if a config directory is available.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("darkroom").join("config.toml"))
    }

    /// Loads config from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        toml::from_str(&contents).unwrap_or_default()
    }

    /// Writes config to disk, ignoring filesystem/serialization errors.
    pub fn save(&self) {
        let Some(path) = Self::config_path() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(s) = toml::to_string_pretty(self) {
            let _ = std::fs::write(&path, s);
        }
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }
}
