//! Scheduler configuration.
//!
//! Supports loading configuration from:
//! 1. Configuration files (YAML)
//! 2. Environment variables (with FERRY_ prefix)
//!
//! Environment variables take precedence over the file, which takes
//! precedence over the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

/// Name of the state database inside the state directory.
pub const STATE_DB_FILE: &str = "ferry.db";

/// Complete scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// State store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Job execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Housekeeping settings
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,

    /// Services started with the scheduler, in start order
    #[serde(default = "default_services")]
    pub services: Vec<String>,
}

/// State store settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path; in-memory when absent
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Job execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Copy engine polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Metrics sampling interval in seconds
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    /// Attempts to resolve a copy job after a restart
    #[serde(default = "default_attach_retries")]
    pub attach_retries: u32,

    /// Pause between attach attempts in milliseconds
    #[serde(default = "default_attach_backoff_ms")]
    pub attach_backoff_ms: u64,
}

/// Housekeeping settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    /// Size of the housekeeping pool
    #[serde(default = "default_housekeeping_threads")]
    pub threads: usize,

    /// Delay between housekeeping runs in seconds
    #[serde(default = "default_housekeeping_interval_secs")]
    pub interval_secs: u64,

    /// Age after which finished instances are retired, in seconds
    #[serde(default = "default_retire_grace_secs")]
    pub retire_grace_secs: u64,

    /// Age after which retired instances are purged, in seconds
    #[serde(default = "default_purge_age_secs")]
    pub purge_age_secs: u64,
}

// Default value functions
fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_metrics_interval_secs() -> u64 {
    30
}

fn default_attach_retries() -> u32 {
    10
}

fn default_attach_backoff_ms() -> u64 {
    2000
}

fn default_housekeeping_threads() -> usize {
    2
}

fn default_housekeeping_interval_secs() -> u64 {
    3600
}

fn default_retire_grace_secs() -> u64 {
    7 * 24 * 3600 // 7 days
}

fn default_purge_age_secs() -> u64 {
    30 * 24 * 3600 // 30 days
}

fn default_services() -> Vec<String> {
    vec![
        "housekeeping".to_string(),
        "recovery".to_string(),
        "triggers".to_string(),
    ]
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            execution: ExecutionConfig::default(),
            housekeeping: HousekeepingConfig::default(),
            services: default_services(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            metrics_interval_secs: default_metrics_interval_secs(),
            attach_retries: default_attach_retries(),
            attach_backoff_ms: default_attach_backoff_ms(),
        }
    }
}

impl ExecutionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn attach_backoff(&self) -> Duration {
        Duration::from_millis(self.attach_backoff_ms)
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            threads: default_housekeeping_threads(),
            interval_secs: default_housekeeping_interval_secs(),
            retire_grace_secs: default_retire_grace_secs(),
            purge_age_secs: default_purge_age_secs(),
        }
    }
}

impl HousekeepingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> SchedResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: SchedulerConfig = serde_yaml_ng::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration: file if given, else defaults, then environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> SchedResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `FERRY_*` environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a variable lookup.
    ///
    /// Only variables that are set override the current values; values that
    /// do not parse are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FERRY_STATE_DIR") {
            self.store.path = Some(PathBuf::from(dir).join(STATE_DB_FILE));
        }
        if let Some(v) = lookup("FERRY_METRICS_INTERVAL_SECS") {
            if let Ok(val) = v.trim().parse() {
                self.execution.metrics_interval_secs = val;
            }
        }
        if let Some(v) = lookup("FERRY_HOUSEKEEPING_THREADS") {
            if let Ok(val) = v.trim().parse() {
                self.housekeeping.threads = val;
            }
        }
        if let Some(v) = lookup("FERRY_SERVICES") {
            self.services = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> SchedResult<()> {
        if self.execution.poll_interval_ms == 0 {
            return Err(SchedError::ConfigError(
                "execution.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.execution.metrics_interval_secs == 0 {
            return Err(SchedError::ConfigError(
                "execution.metrics_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.execution.attach_retries == 0 {
            return Err(SchedError::ConfigError(
                "execution.attach_retries must be at least 1".to_string(),
            ));
        }
        if self.housekeeping.threads == 0 {
            return Err(SchedError::ConfigError(
                "housekeeping.threads must be greater than 0".to_string(),
            ));
        }
        if self.housekeeping.interval_secs == 0 {
            return Err(SchedError::ConfigError(
                "housekeeping.interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert!(config.store.path.is_none());
        assert_eq!(config.execution.attach_retries, 10);
        assert_eq!(config.execution.attach_backoff(), Duration::from_secs(2));
        assert_eq!(config.housekeeping.threads, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.yaml");
        std::fs::write(
            &path,
            "execution:\n  metrics_interval_secs: 5\nhousekeeping:\n  threads: 4\nservices: [recovery]\n",
        )
        .unwrap();

        let config = SchedulerConfig::from_file(&path).unwrap();
        assert_eq!(config.execution.metrics_interval_secs, 5);
        assert_eq!(config.execution.poll_interval_ms, 1000);
        assert_eq!(config.housekeeping.threads, 4);
        assert_eq!(config.services, vec!["recovery".to_string()]);
    }

    #[test]
    fn test_env_overrides() {
        let mut env = FxHashMap::default();
        env.insert("FERRY_STATE_DIR", "/var/lib/ferry");
        env.insert("FERRY_HOUSEKEEPING_THREADS", "8");
        env.insert("FERRY_METRICS_INTERVAL_SECS", "not-a-number");
        env.insert("FERRY_SERVICES", "recovery, triggers");

        let mut config = SchedulerConfig::default();
        config.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(
            config.store.path,
            Some(PathBuf::from("/var/lib/ferry").join(STATE_DB_FILE))
        );
        assert_eq!(config.housekeeping.threads, 8);
        assert_eq!(config.execution.metrics_interval_secs, 30);
        assert_eq!(config.services, vec!["recovery", "triggers"]);
    }

    #[test]
    fn test_validation() {
        let mut config = SchedulerConfig::default();
        config.housekeeping.threads = 0;
        assert!(matches!(config.validate(), Err(SchedError::ConfigError(_))));

        let mut config = SchedulerConfig::default();
        config.execution.metrics_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
