//! Engine configuration persisted as JSON.
//!
//! The file lives in the standard configuration directory
//! (`~/.config/autoflow/config.json` on most platforms) unless
//! `AUTOFLOW_CONFIG_PATH` points elsewhere. A missing file yields defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs_next::{config_dir, data_dir, home_dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::DEFAULT_PREVIEW_CHARS;

/// Environment variable allowing callers to override the config file path.
pub const CONFIG_PATH_ENV: &str = "AUTOFLOW_CONFIG_PATH";

/// Default filename for the JSON payload.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Error surfaced when reading configuration fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Default retry behaviour for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Provider error kinds eligible for retry, in `snake_case`.
    pub retry_on: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            retry_on: vec!["transient".into(), "timeout".into(), "rate_limited".into()],
        }
    }
}

/// Scheduler sweep and leadership settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub sweep_interval_secs: u64,
    pub lease_ttl_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            lease_ttl_secs: 120,
        }
    }
}

impl SchedulerSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(self.sweep_interval_secs.max(1)))
    }
}

/// Inbound webhook listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebhookSettings {
    pub bind_address: String,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8787".into(),
        }
    }
}

/// Process-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetrySettings,
    /// Per-attempt provider timeout.
    pub provider_timeout_ms: u64,
    /// Characters kept in `output_preview`.
    pub output_preview_chars: usize,
    pub scheduler: SchedulerSettings,
    pub webhook: WebhookSettings,
    /// Directory holding credential, job and execution files.
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            provider_timeout_ms: 30_000,
            output_preview_chars: DEFAULT_PREVIEW_CHARS,
            scheduler: SchedulerSettings::default(),
            webhook: WebhookSettings::default(),
            data_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load from `AUTOFLOW_CONFIG_PATH` or the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&default_config_path())
    }

    /// Load from an explicit path; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = match fs::read_to_string(path) {
            Ok(data) => serde_json::from_str::<EngineConfig>(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found; using defaults");
                EngineConfig::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid("retry.base_delay_ms exceeds retry.max_delay_ms".into()));
        }
        if self.provider_timeout_ms == 0 {
            return Err(ConfigError::Invalid("provider_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    /// Directory for persisted state, defaulting to the platform data directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return expand_tilde(&dir.to_string_lossy());
        }
        data_dir().unwrap_or_else(|| PathBuf::from(".")).join("autoflow")
    }
}

/// `~` and `~/rest` resolve against the home directory.
fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    let home = || home_dir().unwrap_or_else(|| PathBuf::from("~"));
    match trimmed.strip_prefix('~') {
        Some("") => home(),
        Some(rest) if rest.starts_with(['/', '\\']) => home().join(&rest[1..]),
        _ => PathBuf::from(trimmed),
    }
}

fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return expand_tilde(trimmed);
        }
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("autoflow")
        .join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig::load_from(&dir.path().join("absent.json")).expect("config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.output_preview_chars, 500);
    }

    #[test]
    fn partial_file_overrides_selected_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"retry": {"max_attempts": 5}, "provider_timeout_ms": 1000}"#).expect("write");

        let config = EngineConfig::load_from(&path).expect("config");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.provider_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"retry": {"max_attempts": 0}}"#).expect("write");
        assert!(matches!(EngineConfig::load_from(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn data_dir_expands_home() {
        let config = EngineConfig {
            data_dir: Some(PathBuf::from("~/autoflow-data")),
            ..EngineConfig::default()
        };
        let expected = home_dir().expect("home").join("autoflow-data");
        assert_eq!(config.resolved_data_dir(), expected);
        assert_eq!(expand_tilde(" /srv/autoflow "), PathBuf::from("/srv/autoflow"));
    }

    #[test]
    fn config_path_env_override_is_honoured() {
        temp_env::with_var(CONFIG_PATH_ENV, Some("/tmp/autoflow-test/config.json"), || {
            assert_eq!(default_config_path(), PathBuf::from("/tmp/autoflow-test/config.json"));
        });
    }
}
