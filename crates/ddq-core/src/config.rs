//! Harness configuration.
//!
//! A harness config file is YAML:
//!
//! ```yaml
//! timeout_ms: 90000
//! scenarios: [polling, wrapped-message]
//! backend:
//!   owner: tester
//!   topics: Test Topic
//!   pollingDelayMs: 150
//!   heartbeatLifetimeSeconds: 1
//! ```
//!
//! Backend keys keep the camelCase names plugins accept; an empty
//! `scenarios` list means every scenario runs.

use ddq_proto::{BackendConfig, BackendError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default watchdog for a full run. Generous enough for slow CI databases.
pub const DEFAULT_TIMEOUT_MS: u64 = 90_000;

/// Errors loading a harness configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid backend config: {0}")]
    Invalid(#[from] BackendError),

    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,
}

/// Top-level harness configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Configuration handed (as a copy) to every backend instance.
    pub backend: BackendConfig,

    /// Global watchdog for the whole run, in milliseconds.
    pub timeout_ms: u64,

    /// Scenario ids to run. Empty runs all of them.
    pub scenarios: Vec<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            scenarios: Vec::new(),
        }
    }
}

impl HarnessConfig {
    /// Loads and validates a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded harness config");
        Self::from_yaml(&content)
    }

    /// Parses and validates a YAML config.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the watchdog and the backend config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        self.backend.validate()?;
        Ok(())
    }

    /// The global watchdog duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(90));
        assert!(config.scenarios.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
timeout_ms: 30000
scenarios:
  - polling
  - dedup
backend:
  owner: tester
  topic: Test Topic
  pollingDelayMs: 150
  heartbeatLifetimeSeconds: 1
"#;
        let config = HarnessConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.scenarios, vec!["polling", "dedup"]);
        assert_eq!(config.backend.polling_delay_ms, 150);
        assert_eq!(config.backend.topics, "Test Topic");
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = HarnessConfig::from_yaml("{}").unwrap();
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn test_rejects_invalid_backend() {
        let yaml = r#"
backend:
  heartbeatCleanupDelayMs: 0
"#;
        let err = HarnessConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = HarnessConfig::from_yaml("timeout_ms: 0").unwrap_err();
        assert!(matches!(err, ConfigError::ZeroTimeout));
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let err = HarnessConfig::from_yaml("backend: [not, a, map]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timeout_ms: 5000").unwrap();
        writeln!(file, "backend:").unwrap();
        writeln!(file, "  database: fileQueue").unwrap();

        let config = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.backend.database, "fileQueue");
    }

    #[test]
    fn test_from_missing_file() {
        let err = HarnessConfig::from_file("/nonexistent/ddq.yml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
