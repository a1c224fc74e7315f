//! Replication policy definitions.
//!
//! Policies are YAML documents:
//!
//! ```yaml
//! name: nightly-dr
//! source_cluster: primary
//! target_cluster: backup
//! frequency_secs: 3600
//! retry:
//!   max_attempts: 3
//!   delay_secs: 60
//! jobs:
//!   - identifier: warehouse
//!     type: HDFS
//!     properties:
//!       sourceNN: hdfs://primary-nn:8020
//!       targetNN: hdfs://backup-nn:8020
//!       sourceDataset: /apps/warehouse
//! ```

use std::path::Path;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::chain::build_chain;
use crate::error::{SchedError, SchedResult};
use crate::job::{ReplicationJobDetail, ReplicationType};

/// Retry settings of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between a failed attempt and the next one.
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,

    /// Multiplier applied to the delay after each further failure.
    #[serde(default)]
    pub backoff_factor: Option<f64>,

    /// Upper bound on the backed-off delay.
    #[serde(default)]
    pub max_delay_secs: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_secs() -> u64 {
    30
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_secs: default_delay_secs(),
            backoff_factor: None,
            max_delay_secs: None,
        }
    }
}

impl RetryPolicy {
    /// Create retry settings with a fixed delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_secs: delay.as_secs(),
            backoff_factor: None,
            max_delay_secs: None,
        }
    }

    /// Delay to observe after `failed_attempts` failures.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let base = self.delay_secs as f64;
        let secs = match self.backoff_factor {
            Some(factor) if factor > 1.0 && failed_attempts > 1 => {
                base * factor.powi(failed_attempts.saturating_sub(1).min(32) as i32)
            }
            _ => base,
        };
        let secs = match self.max_delay_secs {
            Some(max) => secs.min(max as f64),
            None => secs,
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// One job entry of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyJob {
    pub identifier: String,

    #[serde(rename = "type")]
    pub job_type: String,

    #[serde(default)]
    pub properties: FxHashMap<String, String>,
}

/// Declarative definition of what to replicate, where, how often, and with
/// what retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    pub name: String,

    #[serde(default)]
    pub source_cluster: Option<String>,

    #[serde(default)]
    pub target_cluster: Option<String>,

    /// Trigger interval in seconds.
    #[serde(default = "default_frequency_secs")]
    pub frequency_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    pub jobs: Vec<PolicyJob>,
}

fn default_frequency_secs() -> u64 {
    3600
}

impl ReplicationPolicy {
    /// Create a policy with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_cluster: None,
            target_cluster: None,
            frequency_secs: default_frequency_secs(),
            retry: RetryPolicy::default(),
            jobs: Vec::new(),
        }
    }

    /// Add a job.
    pub fn with_job(
        mut self,
        identifier: impl Into<String>,
        job_type: ReplicationType,
        properties: impl IntoIterator<Item = (&'static str, String)>,
    ) -> Self {
        self.jobs.push(PolicyJob {
            identifier: identifier.into(),
            job_type: job_type.name().to_string(),
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        });
        self
    }

    /// Set the retry settings.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the trigger interval.
    pub fn with_frequency(mut self, frequency: Duration) -> Self {
        self.frequency_secs = frequency.as_secs();
        self
    }

    /// Parse a policy from YAML.
    pub fn from_yaml(contents: &str) -> SchedResult<Self> {
        let policy: ReplicationPolicy = serde_yaml_ng::from_str(contents)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Load a policy from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> SchedResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Validate the policy.
    pub fn validate(&self) -> SchedResult<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(SchedError::InvalidPolicy("name cannot be empty".into()));
        }
        if name.contains('@') {
            return Err(SchedError::InvalidPolicy(format!(
                "name '{name}' must not contain '@'"
            )));
        }
        if self.jobs.is_empty() {
            return Err(SchedError::InvalidPolicy(format!(
                "policy '{name}' has no jobs"
            )));
        }
        if self.frequency_secs == 0 {
            return Err(SchedError::InvalidPolicy(
                "frequency_secs must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SchedError::InvalidPolicy(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        for job in &self.jobs {
            let job_type: ReplicationType = job.job_type.parse()?;
            if job_type.is_sentinel() {
                return Err(SchedError::InvalidPolicy(format!(
                    "job '{}' uses reserved type {job_type}",
                    job.identifier
                )));
            }
        }
        Ok(())
    }

    /// Job descriptors in policy order.
    pub fn job_details(&self) -> SchedResult<Vec<ReplicationJobDetail>> {
        self.jobs
            .iter()
            .map(|job| {
                ReplicationJobDetail::parse(
                    job.identifier.clone(),
                    self.name.clone(),
                    &job.job_type,
                    Some(job.properties.clone()),
                )
            })
            .collect()
    }

    /// Full node chain including the sentinels.
    pub fn chain(&self) -> SchedResult<Vec<ReplicationJobDetail>> {
        build_chain(&self.job_details()?)
    }

    /// Trigger interval.
    pub fn frequency(&self) -> Duration {
        Duration::from_secs(self.frequency_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"
name: nightly-dr
source_cluster: primary
target_cluster: backup
frequency_secs: 600
retry:
  max_attempts: 2
  delay_secs: 5
jobs:
  - identifier: warehouse
    type: HDFS
    properties:
      sourceNN: hdfs://primary-nn:8020
      targetNN: hdfs://backup-nn:8020
      sourceDataset: /apps/warehouse
"#;

    #[test]
    fn test_policy_from_yaml() {
        let policy = ReplicationPolicy::from_yaml(POLICY).unwrap();
        assert_eq!(policy.name, "nightly-dr");
        assert_eq!(policy.retry.max_attempts, 2);
        assert_eq!(policy.frequency(), Duration::from_secs(600));

        let chain = policy.chain().unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[1].job_type(), ReplicationType::Hdfs);
        assert_eq!(chain[1].property("sourceDataset"), Some("/apps/warehouse"));
    }

    #[test]
    fn test_policy_defaults() {
        let policy = ReplicationPolicy::from_yaml(
            "name: p\njobs:\n  - identifier: t\n    type: TEST\n",
        )
        .unwrap();
        assert_eq!(policy.retry, RetryPolicy::default());
        assert_eq!(policy.frequency_secs, 3600);
    }

    #[test]
    fn test_policy_validation() {
        let unknown = "name: p\njobs:\n  - identifier: t\n    type: FTP\n";
        assert!(matches!(
            ReplicationPolicy::from_yaml(unknown),
            Err(SchedError::UnknownReplicationType(_))
        ));

        let reserved = "name: p\njobs:\n  - identifier: t\n    type: START\n";
        assert!(matches!(
            ReplicationPolicy::from_yaml(reserved),
            Err(SchedError::InvalidPolicy(_))
        ));

        assert!(ReplicationPolicy::new("p").validate().is_err());
        assert!(
            ReplicationPolicy::new("p@1")
                .with_job("t", ReplicationType::Test, [])
                .validate()
                .is_err()
        );
        assert!(matches!(
            ReplicationPolicy::from_yaml("name: [unclosed"),
            Err(SchedError::ConfigError(_))
        ));
    }

    #[test]
    fn test_retry_delay_backoff() {
        let fixed = RetryPolicy::fixed(3, Duration::from_secs(5));
        assert_eq!(fixed.delay_after(1), Duration::from_secs(5));
        assert_eq!(fixed.delay_after(4), Duration::from_secs(5));

        let backoff = RetryPolicy {
            max_attempts: 5,
            delay_secs: 10,
            backoff_factor: Some(2.0),
            max_delay_secs: Some(30),
        };
        assert_eq!(backoff.delay_after(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_after(2), Duration::from_secs(20));
        assert_eq!(backoff.delay_after(3), Duration::from_secs(30));
    }
}
