//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/docweave/config.toml)
//! 3. Environment variables (DOCWEAVE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Environment variable prefix
const ENV_PREFIX: &str = "DOCWEAVE";

/// Prefix of every on-disk index store
pub const STORE_PREFIX: &str = "docweave";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding index and signature databases
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How long SQLite waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Declarative storage tree, e.g. `{ type = "memory" }`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            busy_timeout_ms: default_busy_timeout_ms(),
            storage: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (DOCWEAVE_DATA_DIR, DOCWEAVE_BUSY_TIMEOUT_MS)
    /// 2. Config file (~/.config/docweave/config.toml or DOCWEAVE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Configuration rooted at `data_dir` with defaults elsewhere
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_BUSY_TIMEOUT_MS", ENV_PREFIX)) {
            self.busy_timeout_ms = val
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}_BUSY_TIMEOUT_MS: {:?}", ENV_PREFIX, val))?;
        }
        Ok(())
    }

    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with DOCWEAVE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docweave")
            .join("config.toml")
    }

    /// SQLite file backing the index store of `database`
    pub fn index_path(&self, database: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}-{}.sqlite", STORE_PREFIX, database))
    }

    /// SQLite file holding the replication signatures of `database`
    pub fn signature_path(&self, database: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}-{}_signatures.sqlite", STORE_PREFIX, database))
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docweave")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}
