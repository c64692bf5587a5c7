//! Engine configuration
//!
//! ```yaml
//! parallel_scenarios: 4
//! connections:
//!   source:
//!     url: sqlite:/var/lib/etl/input.db
//!   dest:
//!     url: postgres://etl:${DEST_PASSWORD}@db:5432/warehouse
//! scripts:
//!   script_dir: /var/lib/etl/scripts
//!   error_script_dir: /var/lib/etl/errors
//! driver:
//!   lines_limit: 500
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use validator::Validate;

use crate::connection::{ConnectionConfig, ConnectionRegistry};
use crate::driver::{DriverOptions, DEFAULT_LINES_LIMIT};
use crate::error::{Error, Result};

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EtlConfig {
    /// Maximum number of scenarios run concurrently by `run_all`
    #[serde(default = "default_parallel_scenarios")]
    #[validate(range(min = 1, max = 256))]
    pub parallel_scenarios: usize,

    /// Logical connection names
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,

    /// Where generated scripts are written
    #[serde(default)]
    pub scripts: ScriptSettings,

    /// Dialect options
    #[serde(default)]
    #[validate(nested)]
    pub driver: DriverSettings,

    /// Free-form properties available to task executors and connectors
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_parallel_scenarios() -> usize {
    1
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            parallel_scenarios: default_parallel_scenarios(),
            connections: BTreeMap::new(),
            scripts: ScriptSettings::default(),
            driver: DriverSettings::default(),
            properties: BTreeMap::new(),
        }
    }
}

/// Script output directories
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScriptSettings {
    /// Directory for saved script units; the working directory when unset
    #[serde(default)]
    pub script_dir: Option<PathBuf>,

    /// Directory for failing script units; `script_dir` when unset
    #[serde(default)]
    pub error_script_dir: Option<PathBuf>,
}

impl ScriptSettings {
    /// Resolved script directory
    pub fn script_dir(&self) -> PathBuf {
        self.script_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolved error script directory
    pub fn error_script_dir(&self) -> PathBuf {
        self.error_script_dir
            .clone()
            .unwrap_or_else(|| self.script_dir())
    }
}

/// Dialect options
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DriverSettings {
    /// Maximum number of lines in one script unit
    #[serde(default = "default_lines_limit")]
    #[validate(range(min = 1))]
    pub lines_limit: usize,

    /// Override of the dialect's binary-in-procedure support
    #[serde(default)]
    pub supports_binary_in_proc: Option<bool>,
}

fn default_lines_limit() -> usize {
    DEFAULT_LINES_LIMIT
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            lines_limit: default_lines_limit(),
            supports_binary_in_proc: None,
        }
    }
}

impl EtlConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text, expanding environment variables
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate field ranges and connection entries
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("invalid configuration: {}", e)))?;

        for (name, connection) in &self.connections {
            if connection.url.trim().is_empty() {
                return Err(Error::config(format!("connection '{}' has an empty url", name)));
            }
        }
        Ok(())
    }

    /// Builder-style connection declaration
    pub fn with_connection(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), config);
        self
    }

    /// Driver options derived from the settings
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            lines_limit: self.driver.lines_limit.max(1),
            supports_binary_in_proc: self.driver.supports_binary_in_proc,
        }
    }

    /// Connection registry with the built-in factories and the declared connections
    pub fn connection_registry(&self) -> ConnectionRegistry {
        ConnectionRegistry::from_configs(
            self.connections
                .iter()
                .map(|(name, config)| (name.clone(), config.clone())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EtlConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.parallel_scenarios, 1);
        assert_eq!(config.driver.lines_limit, DEFAULT_LINES_LIMIT);
        assert!(config.connections.is_empty());
        assert_eq!(config.scripts.script_dir(), PathBuf::from("."));
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        let yaml = "connections:\n  dest:\n    url: \"${RIVVEN_ETL_TEST_UNSET_URL:-sqlite::memory:}\"\n";
        let config = EtlConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.connections["dest"].url, "sqlite::memory:");
    }

    #[test]
    fn test_parallel_scenarios_range() {
        let err = EtlConfig::from_yaml_str("parallel_scenarios: 0").unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
        assert!(EtlConfig::from_yaml_str("parallel_scenarios: 257").is_err());
        assert!(EtlConfig::from_yaml_str("parallel_scenarios: 256").is_ok());
    }

    #[test]
    fn test_empty_connection_url_rejected() {
        let err = EtlConfig::from_yaml_str("connections:\n  source:\n    url: ''\n").unwrap_err();
        assert!(err.to_string().contains("source"));
    }

    #[test]
    fn test_error_script_dir_falls_back() {
        let yaml = "scripts:\n  script_dir: /tmp/etl\n";
        let config = EtlConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.scripts.error_script_dir(), PathBuf::from("/tmp/etl"));
    }

    #[test]
    fn test_driver_options() {
        let yaml = "driver:\n  lines_limit: 50\n  supports_binary_in_proc: true\n";
        let options = EtlConfig::from_yaml_str(yaml).unwrap().driver_options();
        assert_eq!(options.lines_limit, 50);
        assert_eq!(options.supports_binary_in_proc, Some(true));
    }
}
