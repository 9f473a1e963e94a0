//! Configuration management for Shipcheck.
//!
//! Handles loading and saving configuration from TOML files.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache settings
    pub cache: CacheConfig,

    /// Workspace settings
    pub workspace: WorkspaceConfig,

    /// Extra platform label to operating system mappings
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub platforms: IndexMap<String, String>,
}

/// General execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Shell used to run step commands (e.g. "bash -eo pipefail -c")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Maximum number of environments running at once
    pub max_parallel: usize,

    /// Echo step output to the terminal while it runs
    pub stream_output: bool,
}

/// Cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether cache bindings are restored and saved
    pub enabled: bool,

    /// Blob store directory (defaults to the user cache directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Workspace settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Give each environment a private copy of the source tree
    pub isolate: bool,
}

impl Config {
    /// Load configuration for the current directory.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from_dir(Path::new("."))
    }

    /// Load configuration for the project at `dir`.
    ///
    /// Looks for config in:
    /// 1. `.shipcheck.toml` in `dir`
    /// 2. `~/.config/shipcheck/config.toml`
    /// 3. Falls back to defaults
    pub fn load_from_dir(dir: &Path) -> anyhow::Result<Self> {
        // Try local config first
        let local_config = dir.join(".shipcheck.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        // Try global config
        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        tracing::debug!(path = ?path, "Loaded configuration");
        Ok(config)
    }

    /// Save configuration to the global config file.
    pub fn save(&self) -> anyhow::Result<()> {
        let config_dir =
            Self::config_dir().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_dir.join("config.toml"), content)?;

        Ok(())
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("shipcheck"))
    }

    /// Directory cache blobs are stored in.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|d| d.join("shipcheck")))
            .unwrap_or_else(|| PathBuf::from(".shipcheck").join("cache"))
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { shell: None, max_parallel: num_cpus::get().max(1), stream_output: false }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, dir: None }
    }
}
