//! Error handling for the replication scheduler.

use ferry_engine::EngineError;
use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Broad classification of scheduler errors.
///
/// The kind decides what the scheduler does with a failure: configuration
/// errors fail fast and are never retried, transient errors go through the
/// retry controller, consistency errors abort the operation, and
/// interruptions end the attempt as `KILLED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Transient,
    Consistency,
    Interrupted,
    Internal,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transient => "transient",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedError {
    /// Replication type tag not known to the dispatcher.
    #[error("Unknown replication type: {0}")]
    UnknownReplicationType(String),

    /// A job is missing a required property.
    #[error("Job {job}: missing required property '{property}'")]
    MissingProperty { job: String, property: String },

    /// A job property has an unusable value.
    #[error("Job {job}: invalid property '{property}': {message}")]
    InvalidProperty {
        job: String,
        property: String,
        message: String,
    },

    /// Policy definition is not usable.
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// A chain was requested for a policy without jobs.
    #[error("Cannot build a job chain from an empty job list")]
    EmptyChain,

    /// Policy not found in the store.
    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    /// Service identifier not present in the service registry.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Copy engine or filesystem failure.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// The external copy job finished unsuccessfully.
    #[error("Copy job {job_id} ended in state {state}")]
    CopyFailed { job_id: String, state: String },

    /// The external copy job could not be resolved after a restart.
    #[error("Copy job {job_id} could not be attached after {attempts} attempts")]
    AttachFailed { job_id: String, attempts: u32 },

    /// A job reported failure.
    #[error("Job failed: {0}")]
    JobFailed(String),

    /// The instance has used up its attempts.
    #[error("Instance {instance_id} failed permanently after {attempts} attempts")]
    RetriesExhausted { instance_id: String, attempts: u32 },

    /// Instance not found in the store.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// No instance-job row exists at this offset.
    #[error("Instance job not found: {instance_id} offset {offset}")]
    InstanceJobNotFound { instance_id: String, offset: usize },

    /// Requested status transition is not legal from the stored state.
    #[error("Invalid transition for {instance_id} offset {offset}: {from} -> {to}")]
    InvalidTransition {
        instance_id: String,
        offset: usize,
        from: String,
        to: String,
    },

    /// A write carried a run count that is no longer current.
    #[error("Stale run count for {instance_id}: expected {expected}, found {found}")]
    StaleRunCount {
        instance_id: String,
        expected: u32,
        found: u32,
    },

    /// A job was started before all earlier offsets succeeded.
    #[error("Out-of-order start for {instance_id} at offset {offset}")]
    OutOfOrder { instance_id: String, offset: usize },

    /// The store holds rows that violate an invariant.
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    /// A second recovery copy was requested for the same attempt.
    #[error("Recovery limit reached: {0}")]
    RecoveryLimit(String),

    /// Job was cancelled.
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// SQLite database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Internal scheduler error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedError::UnknownReplicationType(_)
            | SchedError::MissingProperty { .. }
            | SchedError::InvalidProperty { .. }
            | SchedError::InvalidPolicy(_)
            | SchedError::EmptyChain
            | SchedError::PolicyNotFound(_)
            | SchedError::UnknownService(_)
            | SchedError::ConfigError(_) => ErrorKind::Configuration,

            SchedError::Engine(_)
            | SchedError::CopyFailed { .. }
            | SchedError::AttachFailed { .. }
            | SchedError::JobFailed(_)
            | SchedError::RetriesExhausted { .. } => ErrorKind::Transient,

            SchedError::InstanceNotFound(_)
            | SchedError::InstanceJobNotFound { .. }
            | SchedError::InvalidTransition { .. }
            | SchedError::StaleRunCount { .. }
            | SchedError::OutOfOrder { .. }
            | SchedError::InconsistentState(_)
            | SchedError::RecoveryLimit(_) => ErrorKind::Consistency,

            SchedError::Cancelled(_) => ErrorKind::Interrupted,

            SchedError::DatabaseError(_)
            | SchedError::IoError(_)
            | SchedError::JsonError(_)
            | SchedError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether another attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient && !matches!(self, SchedError::RetriesExhausted { .. })
    }
}

impl From<rusqlite::Error> for SchedError {
    fn from(e: rusqlite::Error) -> Self {
        SchedError::DatabaseError(e.to_string())
    }
}

impl From<serde_yaml_ng::Error> for SchedError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        SchedError::ConfigError(e.to_string())
    }
}
