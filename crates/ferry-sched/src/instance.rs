//! Durable instance records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobStatus, ReplicationType};

/// Identifier of one scheduled execution of a policy: `<policy>@<sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create the identifier of the `sequence`-th instance of a policy.
    pub fn new(policy_name: &str, sequence: u64) -> Self {
        Self(format!("{policy_name}@{sequence}"))
    }

    /// Parse an identifier.
    pub fn parse(s: &str) -> Option<Self> {
        let (policy, seq) = s.rsplit_once('@')?;
        if policy.is_empty() || seq.parse::<u64>().is_err() {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the policy this instance belongs to.
    pub fn policy_name(&self) -> &str {
        self.0.rsplit_once('@').map(|(p, _)| p).unwrap_or(&self.0)
    }

    /// Sequence number within the policy.
    pub fn sequence(&self) -> u64 {
        self.0
            .rsplit_once('@')
            .and_then(|(_, s)| s.parse().ok())
            .unwrap_or(0)
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One execution of a policy's job chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInstance {
    pub id: InstanceId,
    pub policy_name: String,
    pub status: JobStatus,

    /// Number of attempts launched so far.
    pub run_count: u32,

    /// Offset of the job most recently started.
    pub current_offset: usize,

    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    /// Set once no further attempt will be made.
    pub terminal: bool,

    pub retirement_time: Option<DateTime<Utc>>,
}

impl PolicyInstance {
    /// Check whether the instance is retired.
    pub fn is_retired(&self) -> bool {
        self.retirement_time.is_some()
    }
}

/// Record of one job position within an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceJob {
    pub instance_id: InstanceId,
    pub offset: usize,
    pub identifier: String,
    pub job_type: ReplicationType,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub context_data: Option<String>,
    pub run_count: u32,
    pub retirement_time: Option<DateTime<Utc>>,
}

/// Filter for instance queries.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub policy_name: Option<String>,
    pub status: Option<Vec<JobStatus>>,
    pub include_retired: bool,
    pub limit: Option<usize>,
}

impl InstanceFilter {
    /// Match every live instance.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match instances left running.
    pub fn running() -> Self {
        Self {
            status: Some(vec![JobStatus::Running]),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy_name: impl Into<String>) -> Self {
        self.policy_name = Some(policy_name.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn with_retired(mut self) -> Self {
        self.include_retired = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
