//! Configuration module for the feature pipe
//!
//! The pipe reads a single TOML document describing pool bounds, barrier
//! watchdog, ordering policy and logging. Every field has a default, so an
//! empty or partial file is valid.
//!
//! # Location
//!
//! The default file lives in the platform configuration directory:
//! - **Linux**: `~/.config/feature-pipe/pipe.toml`
//! - **macOS**: `~/Library/Application Support/feature-pipe/pipe.toml`
//! - **Windows**: `%APPDATA%\feature-pipe\pipe.toml`
//!
//! # Example
//!
//! ```ignore
//! use feature_pipe::config::PipeConfig;
//!
//! let mut config = PipeConfig::load_or_default();
//! config.pool.auto_allocate = 4;
//! config.save("pipe.toml")?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{PipeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for configuration directories
pub const APP_ID: &str = "feature-pipe";

/// Configuration filename
pub const CONFIG_FILE: &str = "pipe.toml";

/// Environment variable overriding the configuration path
pub const CONFIG_ENV: &str = "FEATURE_PIPE_CONFIG";

/// Get the default configuration file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// Complete pipe configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    pub pool: PoolSettings,
    pub barrier: BarrierSettings,
    pub ordering: OrderingSettings,
    pub log: LogSettings,
}

impl PipeConfig {
    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse a configuration document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PipeError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `FEATURE_PIPE_CONFIG` or the default location, returning
    /// defaults on any error
    pub fn load_or_default() -> Self {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(default_config_path);

        match path {
            Some(path) if path.exists() => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load pipe config, using defaults: {}", e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Save the configuration, creating parent directories as needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipeError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PipeError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| PipeError::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject combinations the pools cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.pool.auto_allocate == 0 && self.pool.preallocate == 0 {
            return Err(PipeError::Config(
                "pool.auto_allocate and pool.preallocate cannot both be zero".to_string(),
            ));
        }
        if self.log.filter.trim().is_empty() {
            return Err(PipeError::Config("log.filter cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = PipeConfig::from_toml("").unwrap();
        assert_eq!(config, PipeConfig::default());
    }

    #[test]
    fn test_parse_sections() {
        let config = PipeConfig::from_toml(
            r#"
            [pool]
            auto_allocate = 2
            auto_free = 1

            [barrier]
            watchdog_ms = 50

            [ordering]
            ordered_completion = false
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.auto_allocate, 2);
        assert_eq!(config.pool.auto_free, Some(1));
        assert_eq!(config.barrier.watchdog_ms, Some(50));
        assert!(!config.ordering.ordered_completion);
    }

    #[test]
    fn test_rejects_unusable_pool() {
        let err = PipeConfig::from_toml("[pool]\nauto_allocate = 0\n").unwrap_err();
        assert!(matches!(err, PipeError::Config(_)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = PipeConfig::default();
        config.pool.preallocate = 3;
        config.log.directory = Some(dir.path().to_path_buf());
        config.save(&path).unwrap();

        let loaded = PipeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
