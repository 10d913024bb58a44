//! Coordinator configuration
//!
//! Layered as defaults, then an optional TOML file, then `COORDINATOR_*`
//! environment variables, then command-line flags in the binary.
//!
//! ```toml
//! [session]
//! task_deadline_ms = 300000
//!
//! [resolver]
//! confidence_floor = 0.7
//!
//! [evolution]
//! window = 5
//! retirement_threshold = 0.3
//!
//! [persistence]
//! backend = "memory"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelConfig;
use crate::evolution::EvolutionConfig;
use crate::resolver::ResolverConfig;
use crate::retry::RetryPolicy;
use crate::session::SessionConfig;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which persistence backend to open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    /// RocksDB, requires the `heavy-state` feature
    Rocks,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocks" | "rocksdb" => Ok(Self::Rocks),
            other => Err(format!("unknown storage backend: {other}")),
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StorageBackend,
    /// Database directory for the RocksDB backend
    pub path: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from(".coordination-state"),
            retry: RetryPolicy::default(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub session: SessionConfig,
    pub resolver: ResolverConfig,
    pub evolution: EvolutionConfig,
    pub persistence: PersistenceConfig,
    pub channel: ChannelConfig,
}

impl CoordinatorConfig {
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `COORDINATOR_*` overrides from the process environment
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("COORDINATOR_TASK_DEADLINE_MS") {
            self.session.task_deadline_ms = parse("COORDINATOR_TASK_DEADLINE_MS", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_DRY_RUN") {
            self.session.dry_run = parse_bool(&v);
        }
        if let Some(v) = lookup("COORDINATOR_REQUIRE_FULL_CAPACITY") {
            self.session.require_full_capacity = parse_bool(&v);
        }
        if let Some(v) = lookup("COORDINATOR_CONFIDENCE_FLOOR") {
            self.resolver.confidence_floor = parse("COORDINATOR_CONFIDENCE_FLOOR", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_EVOLUTION_WINDOW") {
            self.evolution.window = parse("COORDINATOR_EVOLUTION_WINDOW", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_RETIREMENT_THRESHOLD") {
            self.evolution.retirement_threshold = parse("COORDINATOR_RETIREMENT_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_MAX_WORKERS_PER_CAPABILITY") {
            self.evolution.max_workers_per_capability =
                parse("COORDINATOR_MAX_WORKERS_PER_CAPABILITY", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_SESSIONS_PER_PASS") {
            self.evolution.sessions_per_pass = parse("COORDINATOR_SESSIONS_PER_PASS", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_STORAGE_BACKEND") {
            self.persistence.backend = parse("COORDINATOR_STORAGE_BACKEND", &v)?;
        }
        if let Some(v) = lookup("COORDINATOR_STATE_PATH") {
            self.persistence.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("COORDINATOR_MAX_RETRIES") {
            self.persistence.retry.max_retries = parse("COORDINATOR_MAX_RETRIES", &v)?;
        }
        self.validate()
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        let floor = self.resolver.confidence_floor;
        if !(0.0..=1.0).contains(&floor) {
            return Err(ConfigError::Invalid(format!(
                "resolver.confidence_floor must be within [0, 1], got {floor}"
            )));
        }
        if self.session.task_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "session.task_deadline_ms must be positive".into(),
            ));
        }
        if self.evolution.window == 0 {
            return Err(ConfigError::Invalid("evolution.window must be positive".into()));
        }
        if self.evolution.max_workers_per_capability == 0 {
            return Err(ConfigError::Invalid(
                "evolution.max_workers_per_capability must be positive".into(),
            ));
        }
        let min = self.evolution.min_score;
        if !(0.0..=1.0).contains(&min) {
            return Err(ConfigError::Invalid(format!(
                "evolution.min_score must be within [0, 1], got {min}"
            )));
        }
        if self.channel.inbox_capacity == 0 || self.channel.submission_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacities must be positive".into()));
        }
        if self.persistence.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "persistence.retry.backoff_multiplier must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(value: &str) -> bool {
    value.to_lowercase() == "true" || value == "1"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.task_deadline_ms, 300_000);
        assert_eq!(config.resolver.confidence_floor, 0.7);
        assert_eq!(config.evolution.max_workers_per_capability, 5);
        assert_eq!(config.persistence.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CoordinatorConfig::from_toml_str(
            r#"
            [session]
            dry_run = true

            [evolution]
            window = 3

            [persistence]
            backend = "rocks"
            path = "/var/lib/coordination"

            [persistence.retry]
            max_retries = 7
            "#,
        )
        .unwrap();

        assert!(config.session.dry_run);
        assert_eq!(config.session.task_deadline_ms, 300_000);
        assert_eq!(config.evolution.window, 3);
        assert_eq!(config.evolution.retirement_threshold, 0.3);
        assert_eq!(config.persistence.backend, StorageBackend::Rocks);
        assert_eq!(config.persistence.retry.max_retries, 7);
        assert_eq!(config.persistence.retry.initial_backoff_ms, 200);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[resolver]\nconfidence_floor = 0.5").unwrap();

        let config = CoordinatorConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.resolver.confidence_floor, 0.5);

        let missing = CoordinatorConfig::from_toml_file(Path::new("/nonexistent/coordinator.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let result = CoordinatorConfig::from_toml_str("[resolver]\nconfidence_floor = 1.5");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = CoordinatorConfig::from_toml_str("[evolution]\nwindow = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = CoordinatorConfig::from_toml_str("[session\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("COORDINATOR_TASK_DEADLINE_MS", "1500"),
            ("COORDINATOR_DRY_RUN", "1"),
            ("COORDINATOR_CONFIDENCE_FLOOR", "0.4"),
            ("COORDINATOR_STORAGE_BACKEND", "RocksDB"),
            ("COORDINATOR_SESSIONS_PER_PASS", "10"),
        ]
        .into_iter()
        .collect();

        let mut config = CoordinatorConfig::default();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.session.task_deadline_ms, 1500);
        assert!(config.session.dry_run);
        assert_eq!(config.resolver.confidence_floor, 0.4);
        assert_eq!(config.persistence.backend, StorageBackend::Rocks);
        assert_eq!(config.evolution.sessions_per_pass, 10);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = CoordinatorConfig::default();
        let result = config.apply_env_from(|key| {
            (key == "COORDINATOR_EVOLUTION_WINDOW").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }
}
