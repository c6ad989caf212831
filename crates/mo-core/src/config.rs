use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MoError, Result};

/// Top-level configuration for the record store.
///
/// Usually embedded in the host application's settings; can also be
/// loaded from a standalone TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MoConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl MoConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MoConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| MoError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Database file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `database.sqlite`. Unset means the application
    /// directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_dir: Option<String>,
    /// Seconds a connection waits on a locked database before failing.
    pub busy_timeout_secs: u64,
    /// SQLite journal mode: delete, truncate, persist, memory, wal.
    pub journal_mode: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_dir: None,
            busy_timeout_secs: 30,
            journal_mode: "wal".to_string(),
        }
    }
}

/// Source of the optional database directory override.
///
/// This is the only thing the store needs from the host configuration.
pub trait DatabaseDirSource {
    fn database_dir(&self) -> Option<PathBuf>;
}

impl DatabaseDirSource for StorageConfig {
    fn database_dir(&self) -> Option<PathBuf> {
        self.database_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(expand_home)
    }
}

impl DatabaseDirSource for MoConfig {
    fn database_dir(&self) -> Option<PathBuf> {
        self.storage.database_dir()
    }
}

impl DatabaseDirSource for Option<PathBuf> {
    fn database_dir(&self) -> Option<PathBuf> {
        self.clone()
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(dir: &str) -> PathBuf {
    if dir.starts_with("~/") || dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&dir[2..])
    } else {
        PathBuf::from(dir)
    }
}
