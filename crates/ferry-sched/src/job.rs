//! Job types for the replication scheduler.

use std::str::FromStr;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{SchedError, SchedResult};
use crate::instance::InstanceId;

/// Kind of replication work a job descriptor performs.
///
/// `Start` and `End` are the sentinels bracketing every chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicationType {
    Start,
    End,
    Hdfs,
    HdfsSnapshot,
    Hive,
    Test,
}

impl ReplicationType {
    /// Get the type tag as written in policies and the store.
    pub fn name(&self) -> &'static str {
        match self {
            ReplicationType::Start => "START",
            ReplicationType::End => "END",
            ReplicationType::Hdfs => "HDFS",
            ReplicationType::HdfsSnapshot => "HDFSSNAPSHOT",
            ReplicationType::Hive => "HIVE",
            ReplicationType::Test => "TEST",
        }
    }

    /// Check if this is a chain sentinel.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, ReplicationType::Start | ReplicationType::End)
    }
}

impl std::fmt::Display for ReplicationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ReplicationType {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "START" => Ok(ReplicationType::Start),
            "END" => Ok(ReplicationType::End),
            "HDFS" | "FS" => Ok(ReplicationType::Hdfs),
            "HDFSSNAPSHOT" => Ok(ReplicationType::HdfsSnapshot),
            "HIVE" => Ok(ReplicationType::Hive),
            "TEST" => Ok(ReplicationType::Test),
            _ => Err(SchedError::UnknownReplicationType(s.to_string())),
        }
    }
}

/// Immutable description of one unit of replication work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationJobDetail {
    identifier: String,
    policy_name: String,
    job_type: ReplicationType,
    properties: Option<FxHashMap<String, String>>,
}

impl ReplicationJobDetail {
    /// Create a job descriptor.
    pub fn new(
        identifier: impl Into<String>,
        policy_name: impl Into<String>,
        job_type: ReplicationType,
        properties: Option<FxHashMap<String, String>>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            policy_name: policy_name.into(),
            job_type,
            properties,
        }
    }

    /// Create a job descriptor from a type tag, failing on unknown tags.
    pub fn parse(
        identifier: impl Into<String>,
        policy_name: impl Into<String>,
        job_type: &str,
        properties: Option<FxHashMap<String, String>>,
    ) -> SchedResult<Self> {
        Ok(Self::new(identifier, policy_name, job_type.parse()?, properties))
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn policy_name(&self) -> &str {
        &self.policy_name
    }

    pub fn job_type(&self) -> ReplicationType {
        self.job_type
    }

    /// Property bag; `None` for sentinels.
    pub fn properties(&self) -> Option<&FxHashMap<String, String>> {
        self.properties.as_ref()
    }

    /// Look up a property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .as_ref()
            .and_then(|p| p.get(key))
            .map(String::as_str)
    }

    /// Look up a property that must be present and non-blank.
    pub fn required(&self, key: &str) -> SchedResult<&str> {
        self.property(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| SchedError::MissingProperty {
                job: self.identifier.clone(),
                property: key.to_string(),
            })
    }

    /// Parse an optional property.
    pub fn parsed<T: FromStr>(&self, key: &str) -> SchedResult<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        self.property(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| SchedError::InvalidProperty {
                    job: self.identifier.clone(),
                    property: key.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Check if this is a chain sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.job_type.is_sentinel()
    }
}

/// Status of an instance or of one job within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    NotStarted,
    Running,
    Success,
    Failed,
    Killed,
}

impl JobStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Killed)
    }

    /// Get the status name as stored.
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::NotStarted => "NOT_STARTED",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Killed => "KILLED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for JobStatus {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NOT_STARTED" => Ok(JobStatus::NotStarted),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            "KILLED" => Ok(JobStatus::Killed),
            other => Err(SchedError::DatabaseError(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Mutable state of one job execution within an attempt.
///
/// Owned by the worker running the chain and rebuilt from the store after a
/// restart.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Instance being executed.
    pub instance_id: InstanceId,

    /// Position of the current job in the chain.
    pub offset: usize,

    /// Run count of the attempt this context belongs to.
    pub run_count: u32,

    /// Cumulative position within the current copy (bytes copied).
    pub cursor: u64,

    /// Opaque recovery state persisted with the instance job.
    pub recovery_context: Option<String>,

    /// Set when the job is being resumed after an interruption.
    pub recovering: bool,

    cancel: CancellationToken,
}

impl JobContext {
    /// Create a context for the first job of an attempt.
    pub fn new(instance_id: InstanceId, run_count: u32, cancel: CancellationToken) -> Self {
        Self {
            instance_id,
            offset: 0,
            run_count,
            cursor: 0,
            recovery_context: None,
            recovering: false,
            cancel,
        }
    }

    /// Move to the job at `offset`, dropping per-job state.
    pub fn advance_to(&mut self, offset: usize) {
        self.offset = offset;
        self.cursor = 0;
        self.recovery_context = None;
        self.recovering = false;
    }

    /// Check whether the attempt has been interrupted.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token signalled when the attempt is interrupted.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Result of a successful `perform` or recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Message stored with the instance job.
    pub message: String,
}

impl Completion {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(JobStatus::Success.name())
    }
}
