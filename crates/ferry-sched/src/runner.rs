//! Sequential execution of an instance's node chain.
//!
//! One attempt runs the chain from its first offset that is not `SUCCESS`
//! to the END sentinel, one job at a time. Each job is recorded `RUNNING`
//! before `init` and gets its terminal status once `cleanup` ran, except
//! for interrupted jobs, which are recorded `KILLED` before `cleanup`.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::dispatch;
use crate::error::{ErrorKind, SchedError, SchedResult};
use crate::execution::{JobEnvironment, RecoveryOutcome, ReplicationJob};
use crate::instance::{InstanceId, InstanceJob};
use crate::job::{Completion, JobContext, JobStatus, ReplicationJobDetail};

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub status: JobStatus,
    pub message: String,
    /// The instance must not be relaunched.
    pub terminal: bool,
}

impl AttemptOutcome {
    fn success() -> Self {
        Self {
            status: JobStatus::Success,
            message: Completion::success().message,
            terminal: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

enum Step {
    Continue,
    Stop(AttemptOutcome),
}

enum Finished {
    Done(Completion),
    Unrecovered(String),
}

/// First offset of a chain that still has to run.
pub fn resume_offset(jobs: &[InstanceJob]) -> usize {
    jobs.iter()
        .find(|j| j.status != JobStatus::Success)
        .map(|j| j.offset)
        .unwrap_or(jobs.len())
}

/// Runs attempts of policy instances.
#[derive(Clone)]
pub struct ChainRunner {
    env: JobEnvironment,
}

impl ChainRunner {
    pub fn new(env: JobEnvironment) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &JobEnvironment {
        &self.env
    }

    /// Run an attempt opened with `run_count` and record its outcome.
    pub async fn run_attempt(
        &self,
        instance_id: &InstanceId,
        chain: &[ReplicationJobDetail],
        run_count: u32,
        cancel: CancellationToken,
    ) -> SchedResult<AttemptOutcome> {
        let jobs = self.checked_jobs(instance_id, chain).await?;
        let start = resume_offset(&jobs);
        info!(instance = %instance_id, run_count, offset = start, "Starting attempt");

        let mut ctx = JobContext::new(instance_id.clone(), run_count, cancel);
        self.run_from(chain, start, &mut ctx).await
    }

    /// Resume an attempt a previous process left `RUNNING`.
    ///
    /// The job recorded as running goes through `recover`; the rest of the
    /// chain runs normally afterwards.
    pub async fn resume(
        &self,
        instance_id: &InstanceId,
        chain: &[ReplicationJobDetail],
        cancel: CancellationToken,
    ) -> SchedResult<AttemptOutcome> {
        let instance = self
            .env
            .store
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| SchedError::InstanceNotFound(instance_id.to_string()))?;
        if instance.status != JobStatus::Running {
            return Err(SchedError::InconsistentState(format!(
                "instance {instance_id} is {}, only RUNNING instances can be resumed",
                instance.status
            )));
        }

        let jobs = self.checked_jobs(instance_id, chain).await?;
        let mut ctx = JobContext::new(instance_id.clone(), instance.run_count, cancel);

        let Some(running) = jobs.iter().find(|j| j.status == JobStatus::Running) else {
            let start = resume_offset(&jobs);
            info!(instance = %instance_id, offset = start, "Resuming between jobs");
            return self.run_from(chain, start, &mut ctx).await;
        };

        info!(
            instance = %instance_id,
            offset = running.offset,
            job = %running.identifier,
            "Recovering interrupted job"
        );
        ctx.advance_to(running.offset);
        ctx.recovering = true;
        ctx.recovery_context = running.context_data.clone();

        match self.execute(&chain[running.offset], &mut ctx).await? {
            Step::Stop(outcome) => self.finish(&ctx, outcome).await,
            Step::Continue => self.run_from(chain, running.offset + 1, &mut ctx).await,
        }
    }

    async fn checked_jobs(
        &self,
        instance_id: &InstanceId,
        chain: &[ReplicationJobDetail],
    ) -> SchedResult<Vec<InstanceJob>> {
        let jobs = self.env.store.instance_jobs(instance_id).await?;
        let matches = jobs.len() == chain.len()
            && jobs
                .iter()
                .zip(chain)
                .all(|(row, detail)| row.identifier == detail.identifier());
        if !matches {
            return Err(SchedError::InconsistentState(format!(
                "stored jobs of {instance_id} do not match the policy's chain"
            )));
        }
        Ok(jobs)
    }

    async fn run_from(
        &self,
        chain: &[ReplicationJobDetail],
        start: usize,
        ctx: &mut JobContext,
    ) -> SchedResult<AttemptOutcome> {
        for (offset, detail) in chain.iter().enumerate().skip(start) {
            ctx.advance_to(offset);
            self.env
                .store
                .record_start(&ctx.instance_id, offset, ctx.run_count, self.env.clock.now())
                .await?;
            if let Step::Stop(outcome) = self.execute(detail, ctx).await? {
                return self.finish(ctx, outcome).await;
            }
        }
        self.finish(ctx, AttemptOutcome::success()).await
    }

    async fn finish(&self, ctx: &JobContext, outcome: AttemptOutcome) -> SchedResult<AttemptOutcome> {
        self.env
            .store
            .finish_attempt(
                &ctx.instance_id,
                ctx.run_count,
                outcome.status,
                &outcome.message,
                self.env.clock.now(),
                outcome.terminal,
            )
            .await?;
        info!(
            instance = %ctx.instance_id,
            run_count = ctx.run_count,
            status = %outcome.status,
            "Attempt finished"
        );
        Ok(outcome)
    }

    /// Drive one job, already recorded `RUNNING`, through its lifecycle.
    async fn execute(&self, detail: &ReplicationJobDetail, ctx: &mut JobContext) -> SchedResult<Step> {
        if ctx.is_cancelled() {
            return self
                .record_failure(
                    ctx,
                    SchedError::Cancelled(format!("interrupted before {}", detail.identifier())),
                )
                .await;
        }

        let mut job = dispatch(detail.clone(), &self.env);
        debug!(
            instance = %ctx.instance_id,
            offset = ctx.offset,
            job = %detail.identifier(),
            kind = %detail.job_type(),
            "Executing job"
        );

        if let Err(e) = job.init(ctx).await {
            self.cleanup(job.as_mut(), ctx).await;
            return self.record_failure(ctx, e).await;
        }

        let result = if ctx.recovering {
            self.recover(job.as_mut(), ctx).await
        } else {
            job.perform(ctx).await.map(Finished::Done)
        };

        match result {
            Ok(Finished::Done(completion)) => {
                self.cleanup(job.as_mut(), ctx).await;
                self.env
                    .store
                    .record_completion(
                        &ctx.instance_id,
                        ctx.offset,
                        ctx.run_count,
                        JobStatus::Success,
                        &completion.message,
                        self.env.clock.now(),
                        ctx.recovery_context.as_deref(),
                    )
                    .await?;
                Ok(Step::Continue)
            }
            Ok(Finished::Unrecovered(message)) => {
                self.cleanup(job.as_mut(), ctx).await;
                self.record_failure(ctx, SchedError::JobFailed(message)).await
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                let step = self.record_failure(ctx, e).await;
                self.cleanup(job.as_mut(), ctx).await;
                step
            }
            Err(e) => {
                self.cleanup(job.as_mut(), ctx).await;
                self.record_failure(ctx, e).await
            }
        }
    }

    async fn recover(
        &self,
        job: &mut dyn ReplicationJob,
        ctx: &mut JobContext,
    ) -> SchedResult<Finished> {
        match job.recover(ctx).await? {
            RecoveryOutcome::NotLaunched => {
                info!(
                    instance = %ctx.instance_id,
                    offset = ctx.offset,
                    "Nothing launched before the interruption, performing job"
                );
                job.perform(ctx).await.map(Finished::Done)
            }
            RecoveryOutcome::Completed(completion) => Ok(Finished::Done(completion)),
            RecoveryOutcome::Failed(message) => Ok(Finished::Unrecovered(message)),
        }
    }

    async fn cleanup(&self, job: &mut dyn ReplicationJob, ctx: &mut JobContext) {
        if let Err(e) = job.cleanup(ctx).await {
            warn!(
                instance = %ctx.instance_id,
                offset = ctx.offset,
                "Job cleanup failed: {}",
                e
            );
        }
    }

    /// Record a failed job and turn the error into the attempt outcome.
    ///
    /// Store conflicts abort the attempt and are propagated, after a best
    /// effort to mark the job `FAILED`.
    async fn record_failure(&self, ctx: &JobContext, err: SchedError) -> SchedResult<Step> {
        let kind = err.kind();
        if kind == ErrorKind::Consistency && !matches!(err, SchedError::RecoveryLimit(_)) {
            error!(
                instance = %ctx.instance_id,
                offset = ctx.offset,
                "Aborting attempt on store conflict: {}",
                err
            );
            if let Err(e) = self
                .env
                .store
                .record_completion(
                    &ctx.instance_id,
                    ctx.offset,
                    ctx.run_count,
                    JobStatus::Failed,
                    &err.to_string(),
                    self.env.clock.now(),
                    None,
                )
                .await
            {
                debug!(
                    instance = %ctx.instance_id,
                    offset = ctx.offset,
                    "Job not marked failed: {}",
                    e
                );
            }
            return Err(err);
        }

        let status = if kind == ErrorKind::Interrupted {
            JobStatus::Killed
        } else {
            JobStatus::Failed
        };
        let message = err.to_string();
        error!(
            instance = %ctx.instance_id,
            offset = ctx.offset,
            kind = %kind,
            status = %status,
            "Job failed: {}",
            message
        );

        self.env
            .store
            .record_completion(
                &ctx.instance_id,
                ctx.offset,
                ctx.run_count,
                status,
                &message,
                self.env.clock.now(),
                ctx.recovery_context.as_deref(),
            )
            .await?;

        Ok(Step::Stop(AttemptOutcome {
            status,
            message,
            terminal: matches!(kind, ErrorKind::Configuration | ErrorKind::Interrupted),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    use ferry_engine::sim::{SimOutcome, SimulatedEngine};
    use ferry_engine::{CopyJobId, FsRegistry, RunState};
    use rustc_hash::FxHashMap;

    use crate::chain::build_chain;
    use crate::job::ReplicationType;
    use crate::metrics::{MetricsJobType, ReplicationMetrics};
    use crate::persistence::{SqliteStore, StateStore};
    use crate::replication::props;

    fn detail(id: &str, job_type: ReplicationType, props: &[(&str, &str)]) -> ReplicationJobDetail {
        let props: FxHashMap<String, String> = props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ReplicationJobDetail::new(id, "p1", job_type, Some(props))
    }

    struct Fixture {
        engine: Arc<SimulatedEngine>,
        runner: ChainRunner,
        chain: Vec<ReplicationJobDetail>,
        id: InstanceId,
    }

    impl Fixture {
        fn store(&self) -> &Arc<dyn StateStore> {
            &self.runner.env().store
        }

        async fn launch(&self, expected_run_count: u32) -> u32 {
            let jobs = self.store().instance_jobs(&self.id).await.unwrap();
            self.store()
                .increment_run_count(&self.id, resume_offset(&jobs), expected_run_count, Utc::now())
                .await
                .unwrap()
        }

        async fn statuses(&self) -> Vec<JobStatus> {
            self.store()
                .instance_jobs(&self.id)
                .await
                .unwrap()
                .into_iter()
                .map(|j| j.status)
                .collect()
        }
    }

    async fn fixture(details: Vec<ReplicationJobDetail>, engine: SimulatedEngine) -> Fixture {
        let engine = Arc::new(engine);
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let chain = build_chain(&details).unwrap();
        let instance = store.create_instance("p1", &chain, Utc::now()).await.unwrap();
        let env = JobEnvironment::new(engine.clone(), Arc::new(FsRegistry::new()), store);
        Fixture {
            engine,
            runner: ChainRunner::new(env),
            chain,
            id: instance.id,
        }
    }

    fn hdfs(id: &str) -> ReplicationJobDetail {
        detail(id, ReplicationType::Hdfs, &[(props::SOURCE_DATASET, "/apps/dr")])
    }

    #[tokio::test]
    async fn test_successful_chain() {
        let f = fixture(
            vec![hdfs("a"), detail("t", ReplicationType::Test, &[])],
            SimulatedEngine::new(),
        )
        .await;
        let run_count = f.launch(0).await;

        let outcome = f
            .runner
            .run_attempt(&f.id, &f.chain, run_count, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert!(outcome.terminal);
        assert_eq!(f.statuses().await, vec![JobStatus::Success; 4]);

        let instance = f.store().load_instance(&f.id).await.unwrap().unwrap();
        assert_eq!(instance.status, JobStatus::Success);
        assert!(instance.terminal);
    }

    #[tokio::test]
    async fn test_failure_stops_chain_and_retry_resumes() {
        let engine = SimulatedEngine::new();
        engine.script([SimOutcome::Succeed, SimOutcome::Fail("quota".into())]);
        let f = fixture(vec![hdfs("a"), hdfs("b")], engine).await;

        let run_count = f.launch(0).await;
        let outcome = f
            .runner
            .run_attempt(&f.id, &f.chain, run_count, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(!outcome.terminal);
        assert_eq!(
            f.statuses().await,
            vec![
                JobStatus::Success,
                JobStatus::Success,
                JobStatus::Failed,
                JobStatus::NotStarted
            ]
        );

        let run_count = f.launch(run_count).await;
        assert_eq!(run_count, 2);
        let outcome = f
            .runner
            .run_attempt(&f.id, &f.chain, run_count, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_success());
        // Job "a" is not copied again
        assert_eq!(f.engine.submissions(), 3);
    }

    #[tokio::test]
    async fn test_configuration_error_is_terminal() {
        let f = fixture(
            vec![detail("snap", ReplicationType::HdfsSnapshot, &[(props::SOURCE_DATASET, "/x")])],
            SimulatedEngine::new(),
        )
        .await;
        let run_count = f.launch(0).await;

        let outcome = f
            .runner
            .run_attempt(&f.id, &f.chain, run_count, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.terminal);
        assert!(outcome.message.contains("Configuration error"));
        assert_eq!(f.engine.submissions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_kills_copy_job() {
        let engine = SimulatedEngine::new();
        engine.script([SimOutcome::Hang]);
        let f = fixture(vec![hdfs("a")], engine).await;
        let run_count = f.launch(0).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let outcome = f
            .runner
            .run_attempt(&f.id, &f.chain, run_count, cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Killed);
        assert!(outcome.terminal);
        assert_eq!(f.engine.kills(), 1);
        assert_eq!(
            f.engine.state_of(&CopyJobId::new("job_sim_0001")),
            Some(RunState::Killed)
        );

        let row = f.store().get_instance_job(&f.id, 1).await.unwrap();
        assert_eq!(row.status, JobStatus::Killed);
    }

    #[tokio::test]
    async fn test_resume_reattaches_running_copy() {
        let engine = SimulatedEngine::new();
        engine.seed_job("job_old_0007", RunState::Running);
        let f = fixture(vec![hdfs("a")], engine).await;
        let run_count = f.launch(0).await;

        // A previous process got as far as launching the copy of offset 1
        let now = Utc::now();
        f.store().record_start(&f.id, 0, run_count, now).await.unwrap();
        f.store()
            .record_completion(&f.id, 0, run_count, JobStatus::Success, "SUCCESS", now, None)
            .await
            .unwrap();
        f.store().record_start(&f.id, 1, run_count, now).await.unwrap();
        f.store()
            .record_metrics(
                &f.id,
                &ReplicationMetrics::launched(&CopyJobId::new("job_old_0007"), MetricsJobType::Main),
            )
            .await
            .unwrap();

        let outcome = f
            .runner
            .resume(&f.id, &f.chain, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(f.engine.submissions(), 0);
        assert_eq!(f.statuses().await, vec![JobStatus::Success; 3]);

        let info = f.store().load_tracking_info(&f.id).await.unwrap();
        assert_eq!(info.entries().len(), 1);
        assert_eq!(info.current().unwrap().job_id, "job_old_0007");
    }

    #[tokio::test]
    async fn test_resume_without_copy_performs() {
        let f = fixture(vec![hdfs("a")], SimulatedEngine::new()).await;
        let run_count = f.launch(0).await;
        let now = Utc::now();
        f.store().record_start(&f.id, 0, run_count, now).await.unwrap();

        let outcome = f
            .runner
            .resume(&f.id, &f.chain, CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(f.engine.submissions(), 1);
    }

    #[tokio::test]
    async fn test_resume_rejects_idle_instance() {
        let f = fixture(vec![hdfs("a")], SimulatedEngine::new()).await;
        assert!(matches!(
            f.runner.resume(&f.id, &f.chain, CancellationToken::new()).await,
            Err(SchedError::InconsistentState(_))
        ));
    }
}
