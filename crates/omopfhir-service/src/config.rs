//! Application configuration.
//!
//! Loaded once at startup from an optional TOML file, then overridden by
//! `OMOPFHIR__SECTION__KEY` environment variables, e.g.
//! `OMOPFHIR__SEARCH__DEFAULT_COUNT=20`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use omopfhir_mapping::MappingConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("cannot render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.search.default_count == 0 {
            return invalid("search.default_count must be > 0");
        }
        if self.search.max_count == 0 {
            return invalid("search.max_count must be > 0");
        }
        if self.search.default_count > self.search.max_count {
            return invalid("search.default_count must be <= search.max_count");
        }
        if let Some(base_url) = &self.search.base_url
            && url::Url::parse(base_url).is_err()
        {
            return invalid("search.base_url must be an absolute URL");
        }
        if self.mapping.preferred_vocabularies.iter().any(|v| v.trim().is_empty()) {
            return invalid("mapping.preferred_vocabularies must not contain blank entries");
        }
        let defaults = &self.mapping.defaults;
        if defaults.systolic_bp_concept_id == defaults.diastolic_bp_concept_id {
            return invalid("mapping.defaults systolic and diastolic concepts must differ");
        }
        Ok(())
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSettings {
    #[serde(default = "default_search_default")]
    pub default_count: u64,
    #[serde(default = "default_search_max")]
    pub max_count: u64,
    /// Reject unsupported parameters instead of ignoring them.
    #[serde(default)]
    pub strict_parameters: bool,
    /// Absolute references under this URL are treated as local.
    #[serde(default)]
    pub base_url: Option<String>,
}
fn default_search_default() -> u64 {
    10
}
fn default_search_max() -> u64 {
    100
}
impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_count: default_search_default(),
            max_count: default_search_max(),
            strict_parameters: false,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Seed the concept tables with the bundled fixture vocabulary.
    #[serde(default = "default_seed_vocabulary")]
    pub seed_vocabulary: bool,
}
fn default_seed_vocabulary() -> bool {
    true
}
impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            seed_vocabulary: default_seed_vocabulary(),
        }
    }
}

pub mod loader {
    use super::{AppConfig, ConfigError};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default file looked up when no path is given.
    pub const DEFAULT_CONFIG_FILE: &str = "omopfhir.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        let mut builder = Config::builder();
        let file = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if file.exists() {
            builder = builder.add_source(File::from(file));
        } else if path.is_some() {
            tracing::warn!(path = %file.display(), "config file not found, using defaults");
        }
        // OMOPFHIR__SEARCH__MAX_COUNT=50
        builder = builder.add_source(
            Environment::with_prefix("OMOPFHIR")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("mapping.preferred_vocabularies"),
        );
        let merged: AppConfig = builder.build()?.try_deserialize()?;
        merged.validate()?;
        Ok(merged)
    }
}
