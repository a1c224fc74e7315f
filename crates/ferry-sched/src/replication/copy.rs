//! Submitting and monitoring copy jobs.

use ferry_engine::{CopyJobId, CopyJobReport, CopyOptions};
use tracing::{error, info, warn};

use crate::error::{SchedError, SchedResult};
use crate::execution::JobEnvironment;
use crate::job::JobContext;
use crate::metrics::{collect_once, MetricsCollector, MetricsJobType, ReplicationMetrics};
use crate::recovery::{self, RecoveryPlan};

/// Submit a copy job, record it in the tracking info and wait for it.
pub(crate) async fn run_copy(
    env: &JobEnvironment,
    ctx: &JobContext,
    options: &CopyOptions,
    job_type: MetricsJobType,
) -> SchedResult<CopyJobReport> {
    let job_id = env.engine.submit(options).await?;
    info!(
        instance = %ctx.instance_id,
        offset = ctx.offset,
        copy_job = %job_id,
        kind = %job_type,
        source = %options.source,
        target = %options.target,
        "Copy job submitted"
    );
    env.store
        .record_metrics(&ctx.instance_id, &ReplicationMetrics::launched(&job_id, job_type))
        .await?;
    monitor(env, ctx, &job_id, job_type).await
}

/// Wait for a copy job while sampling its metrics.
///
/// On interruption the copy job is killed and the wait ends with
/// [`SchedError::Cancelled`]. The metrics collector is stopped on every
/// exit path.
pub(crate) async fn monitor(
    env: &JobEnvironment,
    ctx: &JobContext,
    job_id: &CopyJobId,
    job_type: MetricsJobType,
) -> SchedResult<CopyJobReport> {
    let collector = MetricsCollector::start(
        env.store.clone(),
        env.engine.clone(),
        ctx.instance_id.clone(),
        job_id.clone(),
        job_type,
        env.settings.metrics_interval(),
    );

    let cancel = ctx.cancellation().clone();
    let waited = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        report = env.engine.wait(job_id, env.settings.poll_interval()) => Some(report),
    };
    collector.stop().await;

    let Some(report) = waited else {
        warn!(instance = %ctx.instance_id, copy_job = %job_id, "Interrupted, killing copy job");
        if let Err(e) = env.engine.kill(job_id).await {
            error!(copy_job = %job_id, "Failed to kill copy job: {}", e);
        }
        if let Err(e) = collect_once(
            env.store.as_ref(),
            env.engine.as_ref(),
            &ctx.instance_id,
            job_id,
            job_type,
        )
        .await
        {
            warn!(copy_job = %job_id, "Failed to capture final metrics: {}", e);
        }
        return Err(SchedError::Cancelled(format!("copy job {job_id} killed")));
    };

    let report = report?;
    let metrics = ReplicationMetrics::from_report(&report, job_type);
    if let Err(e) = env.store.record_metrics(&ctx.instance_id, &metrics).await {
        warn!(copy_job = %job_id, "Failed to capture final metrics: {}", e);
    }
    info!(
        instance = %ctx.instance_id,
        copy_job = %job_id,
        state = %report.state,
        completed = metrics.completed_tasks,
        total = metrics.total_tasks,
        "Copy job finished"
    );
    Ok(report)
}

/// Turn an unsuccessful report into an error.
pub(crate) fn ensure_success(report: &CopyJobReport) -> SchedResult<()> {
    if report.is_successful() {
        Ok(())
    } else {
        Err(SchedError::CopyFailed {
            job_id: report.job_id.to_string(),
            state: report.state.to_string(),
        })
    }
}

/// Where the copy job of an interrupted attempt ended up.
#[derive(Debug)]
pub(crate) enum Reattached {
    /// No copy job was launched.
    NotLaunched,
    /// The copy job succeeded, possibly after waiting for it again.
    Succeeded {
        metrics: ReplicationMetrics,
        report: CopyJobReport,
    },
    /// The copy job failed, was killed or is in an unknown state.
    Ended {
        metrics: ReplicationMetrics,
        report: CopyJobReport,
    },
}

/// Attach to the authoritative copy job and wait for it if it still runs.
pub(crate) async fn reattach(env: &JobEnvironment, ctx: &JobContext) -> SchedResult<Reattached> {
    let (metrics, report) = match recovery::plan(env, ctx).await? {
        RecoveryPlan::Fresh => return Ok(Reattached::NotLaunched),
        RecoveryPlan::Active { metrics, report } => {
            info!(
                instance = %ctx.instance_id,
                copy_job = %report.job_id,
                state = %report.state,
                "Copy job still active, resuming monitoring"
            );
            let report = monitor(env, ctx, &report.job_id, metrics.job_type).await?;
            (metrics, report)
        }
        RecoveryPlan::Finished { metrics, report } => (metrics, report),
    };

    if report.is_successful() {
        Ok(Reattached::Succeeded { metrics, report })
    } else {
        Ok(Reattached::Ended { metrics, report })
    }
}
