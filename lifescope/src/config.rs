//! Runtime configuration parsing.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// What happens to live sessions when the global scope is torn down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTeardown {
    /// Run the full end-of-session sequence for every live session
    #[default]
    Destroy,
    /// Only drop the sessions from the registry
    Deregister,
}

/// Runtime configuration matching the lifescope.yml schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// ID given to the global scope by `Runtime::begin_global`
    #[serde(default = "default_global_id")]
    pub global_id: String,

    /// Upper bound on any scope lock wait, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default)]
    pub session_teardown: SessionTeardown,
}

fn default_global_id() -> String {
    String::from("global")
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            global_id: default_global_id(),
            lock_timeout_ms: default_lock_timeout_ms(),
            session_teardown: SessionTeardown::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.global_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "global_id",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RuntimeConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.session_teardown, SessionTeardown::Destroy);
    }

    #[test]
    fn test_parse_all_fields() {
        let yaml = r#"
global_id: "edge"
lock_timeout_ms: 250
session_teardown: deregister
"#;
        let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.global_id, "edge");
        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.session_teardown, SessionTeardown::Deregister);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = RuntimeConfig::from_yaml_str("lock_timeout_ms: 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "lock_timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_teardown_policy_is_parse_error() {
        let err = RuntimeConfig::from_yaml_str("session_teardown: explode").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "global_id: from-disk").unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.global_id, "from-disk");
        assert_eq!(config.lock_timeout_ms, 5_000);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuntimeConfig::from_file(dir.path().join("absent.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_)));
    }
}
