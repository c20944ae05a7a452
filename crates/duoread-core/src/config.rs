use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::StreamSettings;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root data directory (~/.local/share/duoread)
    pub data_dir: PathBuf,
    /// Collection pages, one directory per collection
    pub pages_dir: PathBuf,
    /// Key-value state (markers, collection index)
    pub state_path: PathBuf,
    /// User settings
    pub settings_path: PathBuf,
}

impl Config {
    /// Load configuration or use defaults
    pub fn load_or_default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("duoread");
        Self::with_data_dir(data_dir)
    }

    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            pages_dir: data_dir.join("pages"),
            state_path: data_dir.join("state.json"),
            settings_path: data_dir.join("settings.json"),
            data_dir,
        }
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.pages_dir)?;
        Ok(())
    }
}

/// User-tunable settings, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How far original output may run ahead of translation output.
    /// Shared by the scheduler and the page engine.
    pub search_range: usize,
    /// Extra attempts for a failed store sync
    pub sync_retries: u32,
    /// Delay before the first retry; grows linearly
    pub sync_backoff_ms: u64,
    /// Capacity of the job event channels
    pub event_buffer: usize,
    pub orig: StreamSettings,
    pub transl: StreamSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            search_range: 10,
            sync_retries: 2,
            sync_backoff_ms: 50,
            event_buffer: 256,
            orig: StreamSettings::default(),
            transl: StreamSettings::translation(),
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults if the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Invalid settings, using defaults");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot read settings, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn sync_backoff(&self) -> Duration {
        Duration::from_millis(self.sync_backoff_ms)
    }
}
