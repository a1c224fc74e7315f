//! Recovery coordination.
//!
//! After a restart, or when an interrupted instance is resumed, the job that
//! was running decides what to do from the copy job recorded in the
//! instance's tracking info:
//!
//! ```text
//!   no metrics entry ─────────────────→ nothing launched, run from scratch
//!   entry (RECOVERY wins over MAIN) ──→ attach ──┬─ running  → monitor, post-process
//!                                                ├─ succeeded → post-process
//!                                                └─ otherwise → delta recovery
//! ```
//!
//! The [`RecoveryCoordinator`] drives this for every instance left `RUNNING`
//! when the scheduler starts.

use std::time::Duration;

use ferry_engine::{CopyEngine, CopyJobId, CopyJobReport};
use tracing::{debug, error, info, warn};

use crate::error::{SchedError, SchedResult};
use crate::execution::JobEnvironment;
use crate::instance::{InstanceFilter, InstanceId};
use crate::job::JobContext;
use crate::metrics::ReplicationMetrics;
use crate::scheduler::ReplicationScheduler;

/// Resolve a copy job, retrying while the engine does not know it yet.
pub async fn attach_with_retries(
    engine: &dyn CopyEngine,
    job_id: &CopyJobId,
    attempts: u32,
    backoff: Duration,
) -> SchedResult<CopyJobReport> {
    for attempt in 1..=attempts {
        match engine.lookup(job_id).await {
            Ok(Some(report)) => {
                debug!(copy_job = %job_id, attempt, state = %report.state, "Attached to copy job");
                return Ok(report);
            }
            Ok(None) => debug!(copy_job = %job_id, attempt, "Copy job not resolvable yet"),
            Err(e) => warn!(copy_job = %job_id, attempt, "Copy job lookup failed: {}", e),
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }
    Err(SchedError::AttachFailed {
        job_id: job_id.to_string(),
        attempts,
    })
}

/// What an interrupted job left behind.
#[derive(Debug, Clone)]
pub enum RecoveryPlan {
    /// No copy job was launched in this attempt.
    Fresh,
    /// The copy job is still pending or running.
    Active {
        metrics: ReplicationMetrics,
        report: CopyJobReport,
    },
    /// The copy job reached a terminal state.
    Finished {
        metrics: ReplicationMetrics,
        report: CopyJobReport,
    },
}

/// Inspect the tracking info of the context's instance and attach to the
/// authoritative copy job.
pub async fn plan(env: &JobEnvironment, ctx: &JobContext) -> SchedResult<RecoveryPlan> {
    let info = env.store.load_tracking_info(&ctx.instance_id).await?;
    let Some(metrics) = info.current().cloned() else {
        return Ok(RecoveryPlan::Fresh);
    };
    if info.has_recovery() {
        debug!(
            instance = %ctx.instance_id,
            copy_job = %metrics.job_id,
            "Recovery job is authoritative"
        );
    }

    let report = attach_with_retries(
        env.engine.as_ref(),
        &metrics.copy_job_id(),
        env.settings.attach_retries,
        env.settings.attach_backoff(),
    )
    .await?;

    if report.state.is_active() {
        Ok(RecoveryPlan::Active { metrics, report })
    } else {
        Ok(RecoveryPlan::Finished { metrics, report })
    }
}

/// Resumes the instances a previous scheduler process left running.
pub struct RecoveryCoordinator {
    scheduler: ReplicationScheduler,
}

impl RecoveryCoordinator {
    pub fn new(scheduler: ReplicationScheduler) -> Self {
        Self { scheduler }
    }

    /// Resume every instance stored as `RUNNING`.
    ///
    /// Returns the instances that were resumed. Failures are logged per
    /// instance and do not stop the scan.
    pub async fn recover_all(&self) -> SchedResult<Vec<InstanceId>> {
        let running = self
            .scheduler
            .store()
            .list_instances(&InstanceFilter::running())
            .await?;

        if running.is_empty() {
            debug!("No interrupted instances");
            return Ok(Vec::new());
        }
        info!(count = running.len(), "Recovering interrupted instances");

        let mut resumed = Vec::with_capacity(running.len());
        for instance in running {
            match self.scheduler.resume(&instance.id).await {
                Ok(()) => resumed.push(instance.id),
                Err(e) => error!(
                    instance = %instance.id,
                    "Failed to resume instance: {}",
                    e
                ),
            }
        }
        Ok(resumed)
    }
}
