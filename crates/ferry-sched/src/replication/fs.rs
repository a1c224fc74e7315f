//! Filesystem replication, optionally snapshot based.
//!
//! A job runs in snapshot mode when all four snapshot retention properties
//! are set, TDE encryption is off, neither side is an HCFS path, the target
//! exists and both directories are snapshottable. In snapshot mode:
//!
//! 1. a source snapshot is taken before the copy,
//! 2. the copy is a diff from the newest snapshot present on both sides,
//! 3. after a successful copy the same snapshot is created on the target and
//!    old snapshots are evicted on both sides.
//!
//! The snapshot taken in step 1 is saved as the job's recovery context so a
//! resumed job finishes the same replication.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ferry_engine::{is_hcfs, ClusterFs, CopyJobReport, SnapshotInfo, CURRENT_STATE};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::copy::{ensure_success, reattach, run_copy, Reattached};
use super::{copy_options, endpoints, props};
use crate::error::{SchedError, SchedResult};
use crate::execution::{JobEnvironment, RecoveryOutcome, ReplicationJob};
use crate::job::{Completion, JobContext, ReplicationJobDetail};
use crate::metrics::MetricsJobType;

/// Prefix of the snapshots this scheduler creates.
pub const SNAPSHOT_PREFIX: &str = "ferry-snapshot-";

/// Name of the snapshot a job takes at `at`.
pub fn snapshot_name(job: &str, at: DateTime<Utc>) -> String {
    format!("{SNAPSHOT_PREFIX}{job}-{}", at.timestamp_millis())
}

/// Snapshots to delete under a retention setting.
///
/// Only snapshots whose name starts with `prefix` are considered. The
/// newest `keep` of them are always retained; older ones are evicted once
/// they exceed `age_limit`.
pub fn snapshots_to_evict(
    snapshots: &[SnapshotInfo],
    prefix: &str,
    now: DateTime<Utc>,
    age_limit: Duration,
    keep: usize,
) -> Vec<String> {
    let mut owned: Vec<&SnapshotInfo> = snapshots
        .iter()
        .filter(|s| s.name.starts_with(prefix))
        .collect();
    owned.sort_by_key(|s| s.created_at);

    let evictable = owned.len().saturating_sub(keep);
    owned[..evictable]
        .iter()
        .filter(|s| now - s.created_at > age_limit)
        .map(|s| s.name.clone())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Retention {
    age_limit: Duration,
    keep: usize,
}

fn retention(
    detail: &ReplicationJobDetail,
    age_key: &str,
    number_key: &str,
) -> SchedResult<Option<Retention>> {
    let age_days = detail.parsed::<u32>(age_key)?;
    let keep = detail.parsed::<usize>(number_key)?;
    Ok(match (age_days, keep) {
        (Some(days), Some(keep)) => Some(Retention {
            age_limit: Duration::days(i64::from(days)),
            keep,
        }),
        _ => None,
    })
}

/// Recovery context of a filesystem job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct FsRecoveryState {
    /// Snapshot taken on the source for this replication.
    snapshot: Option<String>,
    /// Snapshot the copy diffs from.
    replicated_from: Option<String>,
}

/// Filesystem replication strategy for `HDFS` and `HDFSSNAPSHOT` jobs.
pub struct FsReplication {
    detail: ReplicationJobDetail,
    env: JobEnvironment,
    require_snapshot: bool,
    source: String,
    target: String,
    retention: Option<(Retention, Retention)>,
    source_fs: Option<Arc<dyn ClusterFs>>,
    target_fs: Option<Arc<dyn ClusterFs>>,
    snapshot_mode: bool,
    state: FsRecoveryState,
}

impl FsReplication {
    pub fn new(detail: ReplicationJobDetail, env: JobEnvironment, require_snapshot: bool) -> Self {
        Self {
            detail,
            env,
            require_snapshot,
            source: String::new(),
            target: String::new(),
            retention: None,
            source_fs: None,
            target_fs: None,
            snapshot_mode: false,
            state: FsRecoveryState::default(),
        }
    }

    /// Check whether `init` selected snapshot mode.
    pub fn is_snapshot_mode(&self) -> bool {
        self.snapshot_mode
    }

    fn source_fs(&self) -> SchedResult<&Arc<dyn ClusterFs>> {
        self.source_fs
            .as_ref()
            .ok_or_else(|| SchedError::Internal("source filesystem not open".into()))
    }

    fn target_fs(&self) -> SchedResult<&Arc<dyn ClusterFs>> {
        self.target_fs
            .as_ref()
            .ok_or_else(|| SchedError::Internal("target filesystem not open".into()))
    }

    /// Newest target snapshot that also exists on the source.
    async fn latest_replicated_snapshot(&self) -> SchedResult<Option<String>> {
        let on_source: FxHashSet<String> = self
            .source_fs()?
            .list_snapshots(&self.source)
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect();
        let on_target = self.target_fs()?.list_snapshots(&self.target).await?;
        Ok(on_target
            .into_iter()
            .rev()
            .find(|s| on_source.contains(&s.name))
            .map(|s| s.name))
    }

    async fn persist_state(&self, ctx: &mut JobContext) -> SchedResult<()> {
        let json = serde_json::to_string(&self.state)?;
        self.env
            .store
            .save_job_context(&ctx.instance_id, ctx.offset, ctx.run_count, &json)
            .await?;
        ctx.recovery_context = Some(json);
        Ok(())
    }

    /// Snapshot the target and apply retention after a successful copy.
    async fn post_process(&self) -> SchedResult<Completion> {
        let (Some(name), Some((source_retention, target_retention))) =
            (self.state.snapshot.as_deref(), self.retention)
        else {
            return Ok(Completion::success());
        };

        let target_fs = self.target_fs()?;
        let present = target_fs
            .list_snapshots(&self.target)
            .await?
            .iter()
            .any(|s| s.name == name);
        if !present {
            target_fs.create_snapshot(&self.target, name).await?;
            info!(target = %self.target, snapshot = name, "Target snapshot created");
        }

        self.evict(self.source_fs()?, &self.source, source_retention)
            .await;
        self.evict(target_fs, &self.target, target_retention).await;
        Ok(Completion::success())
    }

    /// Apply a retention setting. Failures are logged, never propagated.
    async fn evict(&self, fs: &Arc<dyn ClusterFs>, path: &str, retention: Retention) {
        let snapshots = match fs.list_snapshots(path).await {
            Ok(s) => s,
            Err(e) => {
                warn!(path, "Failed to list snapshots for eviction: {}", e);
                return;
            }
        };
        let prefix = format!("{SNAPSHOT_PREFIX}{}-", self.detail.identifier());
        for name in snapshots_to_evict(
            &snapshots,
            &prefix,
            Utc::now(),
            retention.age_limit,
            retention.keep,
        ) {
            match fs.delete_snapshot(path, &name).await {
                Ok(()) => debug!(path, snapshot = %name, "Snapshot evicted"),
                Err(e) => warn!(path, snapshot = %name, "Failed to evict snapshot: {}", e),
            }
        }
    }

    /// Restore the target after the copy job of an interrupted attempt
    /// failed.
    ///
    /// The attempt itself still fails: a recovery copy only rolls the target
    /// back to the last replicated snapshot.
    async fn delta_recover(
        &self,
        ctx: &mut JobContext,
        failed: &CopyJobReport,
    ) -> SchedResult<RecoveryOutcome> {
        let reason = format!("copy job {} ended in state {}", failed.job_id, failed.state);
        if !self.snapshot_mode {
            return Ok(RecoveryOutcome::Failed(format!(
                "{reason}; no snapshot to recover from"
            )));
        }
        let Some(from) = self.latest_replicated_snapshot().await? else {
            return Ok(RecoveryOutcome::Failed(format!(
                "{reason}; no replicated snapshot on target"
            )));
        };

        let diff = self
            .target_fs()?
            .snapshot_diff(&self.target, &from, CURRENT_STATE)
            .await?;
        if diff.is_empty() {
            info!(
                instance = %ctx.instance_id,
                snapshot = %from,
                "Target unchanged since last replicated snapshot"
            );
            return Ok(RecoveryOutcome::Failed(format!(
                "{reason}; target unchanged since {from}, no recovery needed"
            )));
        }

        info!(
            instance = %ctx.instance_id,
            snapshot = %from,
            changes = diff.len(),
            "Launching recovery copy"
        );
        let options = copy_options(&self.detail, &self.source, &self.target)?
            .with_snapshot_diff(from.as_str(), CURRENT_STATE)
            .in_recovery();
        let report = run_copy(&self.env, ctx, &options, MetricsJobType::Recovery).await?;
        ensure_success(&report)?;
        Ok(RecoveryOutcome::Failed(format!(
            "{reason}; target restored to {from} by recovery job {}",
            report.job_id
        )))
    }
}

#[async_trait::async_trait]
impl ReplicationJob for FsReplication {
    fn detail(&self) -> &ReplicationJobDetail {
        &self.detail
    }

    async fn init(&mut self, ctx: &mut JobContext) -> SchedResult<()> {
        let source_dataset = self.detail.required(props::SOURCE_DATASET)?.to_string();
        let target_dataset = self
            .detail
            .property(props::TARGET_DATASET)
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(&source_dataset)
            .to_string();
        let (source, target) = endpoints(&self.detail, &source_dataset, &target_dataset)?;
        self.source = source;
        self.target = target;

        let hcfs = is_hcfs(&self.source)? || is_hcfs(&self.target)?;
        let tde = self
            .detail
            .parsed::<bool>(props::TDE_ENCRYPTION_ENABLED)?
            .unwrap_or(false);
        let source_retention = retention(
            &self.detail,
            props::SOURCE_SNAPSHOT_AGE_LIMIT,
            props::SOURCE_SNAPSHOT_NUMBER,
        )?;
        let target_retention = retention(
            &self.detail,
            props::TARGET_SNAPSHOT_AGE_LIMIT,
            props::TARGET_SNAPSHOT_NUMBER,
        )?;
        self.retention = source_retention.zip(target_retention);

        if self.retention.is_some() && !tde && !hcfs {
            let source_fs = self.env.filesystems.open(&self.source)?;
            self.source_fs = Some(source_fs.clone());
            let target_fs = self.env.filesystems.open(&self.target)?;
            self.target_fs = Some(target_fs.clone());

            self.snapshot_mode = target_fs.exists(&self.target).await?
                && source_fs.is_snapshottable(&self.source).await?
                && target_fs.is_snapshottable(&self.target).await?;
        }

        if self.require_snapshot && !self.snapshot_mode {
            return Err(SchedError::ConfigError(format!(
                "job {}: {} replication needs all snapshot retention properties, \
                 TDE disabled and snapshottable source and target directories",
                self.detail.identifier(),
                self.detail.job_type()
            )));
        }

        if let Some(raw) = ctx.recovery_context.as_deref() {
            self.state = serde_json::from_str(raw)?;
        }

        debug!(
            job = %self.detail.identifier(),
            source = %self.source,
            target = %self.target,
            hcfs,
            snapshot_mode = self.snapshot_mode,
            "Filesystem replication initialized"
        );
        Ok(())
    }

    async fn perform(&mut self, ctx: &mut JobContext) -> SchedResult<Completion> {
        if self.snapshot_mode {
            let replicated_from = self.latest_replicated_snapshot().await?;
            let name = snapshot_name(self.detail.identifier(), Utc::now());
            self.source_fs()?
                .create_snapshot(&self.source, &name)
                .await?;
            info!(source = %self.source, snapshot = %name, "Source snapshot created");

            self.state = FsRecoveryState {
                snapshot: Some(name),
                replicated_from,
            };
            self.persist_state(ctx).await?;
        }

        let mut options = copy_options(&self.detail, &self.source, &self.target)?;
        if let (Some(from), Some(to)) = (&self.state.replicated_from, &self.state.snapshot) {
            options = options.with_snapshot_diff(from.as_str(), to.as_str());
        }

        let report = run_copy(&self.env, ctx, &options, MetricsJobType::Main).await?;
        ensure_success(&report)?;
        self.post_process().await
    }

    async fn cleanup(&mut self, _ctx: &mut JobContext) -> SchedResult<()> {
        let mut result = Ok(());
        for fs in [self.source_fs.take(), self.target_fs.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = fs.close().await {
                warn!(fs = %fs.uri(), "Failed to close filesystem: {}", e);
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }

    async fn recover(&mut self, ctx: &mut JobContext) -> SchedResult<RecoveryOutcome> {
        match reattach(&self.env, ctx).await? {
            Reattached::NotLaunched => Ok(RecoveryOutcome::NotLaunched),
            Reattached::Succeeded { metrics, report } => {
                if metrics.job_type == MetricsJobType::Recovery {
                    return Ok(RecoveryOutcome::Failed(format!(
                        "target restored by recovery job {}",
                        report.job_id
                    )));
                }
                Ok(RecoveryOutcome::Completed(self.post_process().await?))
            }
            Reattached::Ended { metrics, report } => {
                if metrics.job_type == MetricsJobType::Recovery {
                    return Ok(RecoveryOutcome::Failed(format!(
                        "recovery job {} ended in state {}",
                        report.job_id, report.state
                    )));
                }
                self.delta_recover(ctx, &report).await
            }
        }
    }
}
