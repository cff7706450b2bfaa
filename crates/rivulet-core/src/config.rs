//! Environment configuration sections of `rivulet.toml`
//!
//! Target naming (which database/schema a run writes into) and store
//! connection settings live here; the declaration sections are parsed by
//! [`crate::project`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Project-level settings from the `[project]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// Project name
    pub name: String,

    /// Active target name (e.g. "dev", "prod")
    #[serde(default = "default_target")]
    pub target: String,

    /// Worker pool size for materialization
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Directories scanned for reusable macro fragments (`.sql` files)
    #[serde(default)]
    pub macro_paths: Vec<String>,
}

fn default_target() -> String {
    "dev".to_string()
}

fn default_threads() -> usize {
    4
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            name: "rivulet".to_string(),
            target: default_target(),
            threads: default_threads(),
            macro_paths: Vec::new(),
        }
    }
}

/// A target environment: where materialized objects are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database models are built into
    pub database: String,

    /// Default schema models are built into
    pub schema: String,
}

/// Store connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store type (e.g. "postgres", "memory")
    #[serde(rename = "type")]
    pub store_type: String,

    /// Connection settings (store-specific)
    #[serde(flatten)]
    pub settings: HashMap<String, String>,
}

/// Resolved environment configuration for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Project settings
    #[serde(default)]
    pub project: ProjectSettings,

    /// Named targets
    #[serde(default)]
    pub targets: HashMap<String, TargetConfig>,

    /// Store connection
    #[serde(default)]
    pub store: Option<StoreConfig>,
}

impl Config {
    /// The target the run writes into
    ///
    /// Unknown target names are a configuration error, not a fallback.
    pub fn active_target(&self) -> Result<&TargetConfig, ConfigError> {
        self.targets
            .get(&self.project.target)
            .ok_or_else(|| ConfigError::UnknownTarget(self.project.target.clone()))
    }

    /// Look up a target by name
    pub fn target(&self, name: &str) -> Result<&TargetConfig, ConfigError> {
        self.targets
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: ProjectSettings::default(),
            targets: HashMap::new(),
            store: None,
        }
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown target '{0}': no matching [targets.{0}] section")]
    UnknownTarget(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = ProjectSettings::default();
        assert_eq!(settings.target, "dev");
        assert_eq!(settings.threads, 4);
    }

    #[test]
    fn active_target_lookup() {
        let mut config = Config::default();
        config.targets.insert(
            "dev".to_string(),
            TargetConfig {
                database: "analytics_dev".to_string(),
                schema: "main".to_string(),
            },
        );

        let target = config.active_target().unwrap();
        assert_eq!(target.database, "analytics_dev");

        config.project.target = "prod".to_string();
        assert!(matches!(
            config.active_target(),
            Err(ConfigError::UnknownTarget(_))
        ));
    }

    #[test]
    fn store_config_settings_flatten() {
        let toml = r#"
            type = "postgres"
            host = "localhost"
            dbname = "analytics"
        "#;
        let store: StoreConfig = toml::from_str(toml).unwrap();
        assert_eq!(store.store_type, "postgres");
        assert_eq!(store.settings.get("host").map(String::as_str), Some("localhost"));
    }
}
