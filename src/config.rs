//! Configuration management for the JSONB schema engine
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (jsonb-schemas.toml)
//! - Environment variables (JSONB_SCHEMAS__*)
//!
//! ## Example config file (jsonb-schemas.toml):
//! ```toml
//! [registry]
//! manifest_dir = "./schemas"
//!
//! [store]
//! path = "./state/extensions.json"
//!
//! [patterns]
//! max_length = 256
//! size_limit = 1048576
//!
//! [validation]
//! default_allow_unknown_keys = false
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::regex_safety::PatternLimits;

/// Main configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Extension persistence settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Regex pattern limits for extension fields
    #[serde(default)]
    pub patterns: PatternLimits,

    /// Validation settings
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory of bootstrap manifests (`*.json`, `*.toml`)
    #[serde(default)]
    pub manifest_dir: Option<PathBuf>,
}

/// Extension store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON file holding persisted extensions. Without it, rehydration is skipped.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Validation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Used by manifests that do not set `allow_unknown_keys`
    #[serde(default)]
    pub default_allow_unknown_keys: bool,
}

impl EngineConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, adding a required file on top of the defaults
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = [
            "jsonb-schemas.toml",
            ".jsonb-schemas.toml",
            "config/jsonb-schemas.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "jsonb-schemas") {
            let xdg_config = config_dir.config_dir().join("jsonb-schemas.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }

        // JSONB_SCHEMAS__STORE__PATH=...
        builder = builder.add_source(
            Environment::with_prefix("JSONB_SCHEMAS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn with_manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.registry.manifest_dir = Some(dir.into());
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.store.path.is_none());
        assert!(!config.validation.default_allow_unknown_keys);
        assert_eq!(config.patterns, PatternLimits::default());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let config = EngineConfig::default()
            .with_store_path("state/extensions.json")
            .with_manifest_dir("schemas");
        config.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[store]"));
        assert!(content.contains("[patterns]"));

        let loaded = EngineConfig::load_from(Some(&path)).unwrap();
        assert_eq!(loaded.store.path, Some(PathBuf::from("state/extensions.json")));
        assert_eq!(loaded.registry.manifest_dir, Some(PathBuf::from("schemas")));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[patterns]\nmax_length = 64\n").unwrap();

        let loaded = EngineConfig::load_from(Some(&path)).unwrap();
        assert_eq!(loaded.patterns.max_length, 64);
        assert_eq!(loaded.patterns.size_limit, PatternLimits::default().size_limit);
    }
}
