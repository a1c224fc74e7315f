//! Copy job lifecycle types.
//!
//! The engine-side state machine of one copy job:
//!
//! ```text
//!   submit() ──→ Prep ──→ Running ──→ Succeeded
//!                  │         │
//!                  │         ├──→ Failed(reason)
//!                  │         │
//!                  └─────────┴──→ Killed
//! ```
//!
//! Transitions are monotonic and the terminal states are permanent.
//! `Unknown` is reported when the engine returns a state it cannot map.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Counter group holding job-wide task totals.
pub const JOB_COUNTER_GROUP: &str = "JobCounter";

/// Counter group populated by the copy mappers.
pub const COPY_COUNTER_GROUP: &str = "CopyMapper";

/// Number of map tasks launched.
pub const TOTAL_LAUNCHED_MAPS: &str = "TOTAL_LAUNCHED_MAPS";

/// Number of map tasks that failed.
pub const NUM_FAILED_MAPS: &str = "NUM_FAILED_MAPS";

/// Number of map tasks that were killed.
pub const NUM_KILLED_MAPS: &str = "NUM_KILLED_MAPS";

/// Number of map tasks that completed successfully.
pub const NUM_COMPLETED_MAPS: &str = "NUM_COMPLETED_MAPS";

/// Bytes copied so far.
pub const BYTES_COPIED: &str = "BYTESCOPIED";

/// Unique identifier of a copy job, assigned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CopyJobId(pub String);

impl CopyJobId {
    /// Create a new copy job ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CopyJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CopyJobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CopyJobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Run state of a copy job as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Accepted, waiting for resources.
    Prep,
    /// Tasks are running.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed(String),
    /// Killed on request.
    Killed,
    /// State the engine could not map.
    Unknown(String),
}

impl RunState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed(_) | RunState::Killed
        )
    }

    /// Check if the job is still pending or running.
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Prep | RunState::Running)
    }

    /// Check if the job finished successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, RunState::Succeeded)
    }

    /// Get a human-readable state name.
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Prep => "PREP",
            RunState::Running => "RUNNING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed(_) => "FAILED",
            RunState::Killed => "KILLED",
            RunState::Unknown(_) => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Failed(reason) => write!(f, "FAILED: {reason}"),
            RunState::Unknown(state) => write!(f, "UNKNOWN ({state})"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Snapshot of a copy job's counters, keyed by counter group.
///
/// A group is absent until the engine has published it; callers treat a
/// missing group or counter as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyCounters {
    groups: FxHashMap<String, FxHashMap<String, u64>>,
}

impl CopyCounters {
    /// Create an empty counters snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a counter group.
    pub fn group(&self, name: &str) -> Option<&FxHashMap<String, u64>> {
        self.groups.get(name)
    }

    /// Get a single counter value.
    pub fn get(&self, group: &str, counter: &str) -> Option<u64> {
        self.groups.get(group).and_then(|g| g.get(counter)).copied()
    }

    /// Set a counter value, creating the group if needed.
    pub fn set(&mut self, group: &str, counter: &str, value: u64) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(counter.to_string(), value);
    }

    /// Builder-style variant of [`CopyCounters::set`].
    pub fn with(mut self, group: &str, counter: &str, value: u64) -> Self {
        self.set(group, counter, value);
        self
    }

    /// Check whether no group has been published yet.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Point-in-time view of a copy job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyJobReport {
    /// Engine-assigned identifier.
    pub job_id: CopyJobId,

    /// Current run state.
    pub state: RunState,

    /// Counters published so far.
    pub counters: CopyCounters,

    /// When the engine started the job.
    pub started_at: DateTime<Utc>,

    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl CopyJobReport {
    /// Check whether the job reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check whether the job completed successfully.
    pub fn is_successful(&self) -> bool {
        self.state.is_success()
    }

    /// Milliseconds between start and finish, or until `now` while running.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let end = self.finished_at.unwrap_or(now);
        u64::try_from((end - self.started_at).num_milliseconds()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state() {
        assert!(RunState::Prep.is_active());
        assert!(RunState::Running.is_active());
        assert!(!RunState::Running.is_terminal());

        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Succeeded.is_success());
        assert!(RunState::Failed("oom".into()).is_terminal());
        assert!(!RunState::Failed("oom".into()).is_success());
        assert!(RunState::Killed.is_terminal());

        let unknown = RunState::Unknown("RETIRED".into());
        assert!(!unknown.is_terminal());
        assert!(!unknown.is_active());
        assert_eq!(unknown.to_string(), "UNKNOWN (RETIRED)");
    }

    #[test]
    fn test_counters_missing_group() {
        let counters = CopyCounters::new();
        assert!(counters.is_empty());
        assert_eq!(counters.get(JOB_COUNTER_GROUP, TOTAL_LAUNCHED_MAPS), None);

        let counters = counters.with(JOB_COUNTER_GROUP, TOTAL_LAUNCHED_MAPS, 20);
        assert_eq!(counters.get(JOB_COUNTER_GROUP, TOTAL_LAUNCHED_MAPS), Some(20));
        assert_eq!(counters.get(JOB_COUNTER_GROUP, NUM_FAILED_MAPS), None);
        assert!(counters.group(COPY_COUNTER_GROUP).is_none());
    }

    #[test]
    fn test_report_elapsed() {
        let started_at = Utc::now();
        let report = CopyJobReport {
            job_id: CopyJobId::new("job_1"),
            state: RunState::Succeeded,
            counters: CopyCounters::new(),
            started_at,
            finished_at: Some(started_at + chrono::Duration::milliseconds(1500)),
        };
        assert!(report.is_complete());
        assert!(report.is_successful());
        assert_eq!(report.elapsed_ms(Utc::now()), 1500);
    }
}
