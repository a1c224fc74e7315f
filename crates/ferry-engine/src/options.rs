//! Options for a bulk copy.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Options describing one bulk copy.
///
/// A plain copy moves `source` to `target`. When both snapshot bounds are
/// set the engine copies only the snapshot diff. With `recovery` set the
/// diff is taken on the target and applied in reverse, restoring the target
/// to `from_snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOptions {
    /// Fully-qualified source URI.
    pub source: String,

    /// Fully-qualified target URI.
    pub target: String,

    /// Scheduler queue for the copy tasks.
    pub queue: Option<String>,

    /// Upper bound on concurrent map tasks.
    pub max_maps: Option<u32>,

    /// Per-map bandwidth limit in MB/s.
    pub bandwidth_mb: Option<u32>,

    /// Snapshot the diff starts from.
    pub from_snapshot: Option<String>,

    /// Snapshot the diff ends at (`"."` is the current state).
    pub to_snapshot: Option<String>,

    /// Restore the target to `from_snapshot` instead of copying forward.
    pub recovery: bool,

    /// Skip files that already match on the target.
    pub update: bool,

    /// Delete target files missing from the source.
    pub delete_missing: bool,
}

impl CopyOptions {
    /// Create options for a plain copy.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            queue: None,
            max_maps: None,
            bandwidth_mb: None,
            from_snapshot: None,
            to_snapshot: None,
            recovery: false,
            update: true,
            delete_missing: false,
        }
    }

    /// Set the scheduler queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the maximum number of map tasks.
    pub fn with_max_maps(mut self, max_maps: u32) -> Self {
        self.max_maps = Some(max_maps);
        self
    }

    /// Set the per-map bandwidth limit.
    pub fn with_bandwidth(mut self, mb_per_sec: u32) -> Self {
        self.bandwidth_mb = Some(mb_per_sec);
        self
    }

    /// Restrict the copy to the diff between two snapshots.
    pub fn with_snapshot_diff(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from_snapshot = Some(from.into());
        self.to_snapshot = Some(to.into());
        self
    }

    /// Mark the copy as a recovery copy.
    pub fn in_recovery(mut self) -> Self {
        self.recovery = true;
        self
    }

    /// Delete files on the target that no longer exist on the source.
    pub fn with_delete_missing(mut self) -> Self {
        self.delete_missing = true;
        self
    }

    /// Check whether the copy is restricted to a snapshot diff.
    pub fn is_snapshot_diff(&self) -> bool {
        self.from_snapshot.is_some() && self.to_snapshot.is_some()
    }

    /// Validate the options before submission.
    pub fn validate(&self) -> EngineResult<()> {
        if self.source.trim().is_empty() {
            return Err(EngineError::InvalidOptions("source is empty".into()));
        }
        if self.target.trim().is_empty() {
            return Err(EngineError::InvalidOptions("target is empty".into()));
        }
        if self.from_snapshot.is_some() != self.to_snapshot.is_some() {
            return Err(EngineError::InvalidOptions(
                "snapshot diff needs both bounds".into(),
            ));
        }
        if self.recovery && !self.is_snapshot_diff() {
            return Err(EngineError::InvalidOptions(
                "recovery copy needs a snapshot diff".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_options_builder() {
        let options = CopyOptions::new("hdfs://src:8020/apps/dr", "hdfs://tgt:8020/apps/dr")
            .with_queue("replication")
            .with_max_maps(20)
            .with_bandwidth(100)
            .with_snapshot_diff("ferry-snapshot-p1-1", "ferry-snapshot-p1-2");

        assert_eq!(options.queue.as_deref(), Some("replication"));
        assert_eq!(options.max_maps, Some(20));
        assert!(options.is_snapshot_diff());
        assert!(!options.recovery);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_recovery_requires_diff() {
        let options = CopyOptions::new("hdfs://src/a", "hdfs://tgt/a").in_recovery();
        assert!(matches!(
            options.validate(),
            Err(EngineError::InvalidOptions(_))
        ));

        let options = options.with_snapshot_diff("s1", ".");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_empty_target_rejected() {
        let options = CopyOptions::new("hdfs://src/a", " ");
        assert!(options.validate().is_err());
    }
}
