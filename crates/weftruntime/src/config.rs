use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use weftcore::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine settings. Every field has a default, so an empty TOML file is a
/// valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently running steps within one execution.
    pub max_parallel_steps: usize,
    pub max_resolution_depth: usize,
    pub default_step_timeout_ms: u64,
    pub notify_timeout_ms: u64,
    pub event_buffer_size: usize,
    /// Used by steps that declare no retry policy of their own.
    pub default_retry: RetryPolicy,
    /// File-backed state when set, in-memory otherwise.
    pub state_dir: Option<PathBuf>,
    /// Terminal executions older than this are eligible for purge.
    pub retention_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 10,
            max_resolution_depth: 5,
            default_step_timeout_ms: 300_000,
            notify_timeout_ms: 5_000,
            event_buffer_size: 1000,
            default_retry: RetryPolicy::none(),
            state_dir: None,
            retention_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_steps == 0 {
            return Err(ConfigError::Invalid("max_parallel_steps must be at least 1".into()));
        }
        if self.default_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("default_retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_secs
            .map(|secs| chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_toml_uses_defaults() {
        assert_eq!(EngineConfig::from_toml("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = EngineConfig::from_toml(
            r#"
            max_parallel_steps = 2
            state_dir = "/var/lib/weft"

            [default_retry]
            max_attempts = 4
            delay_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.max_parallel_steps, 2);
        assert_eq!(config.max_resolution_depth, 5);
        assert_eq!(config.state_dir, Some(PathBuf::from("/var/lib/weft")));
        assert_eq!(config.default_retry.max_attempts, 4);
        assert_eq!(config.default_retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn rejects_zero_parallelism() {
        assert!(matches!(
            EngineConfig::from_toml("max_parallel_steps = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn from_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_parallel_steps = [").unwrap();
        let err = EngineConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
