//! Policy scheduler.
//!
//! Every submitted instance gets a driver task that loops
//! `admit → run attempt` until the instance is terminal:
//!
//! ```text
//!   submit_and_track ──→ create instance ──→ driver
//!                                             │
//!             ┌───────────────────────────────┘
//!             ▼
//!   RetryController::admit ──→ ChainRunner::run_attempt ──┬─ terminal ──→ done
//!             ▲                                           │
//!             └──────────────── FAILED, budget left ──────┘
//! ```
//!
//! Drivers of different instances run in parallel; within an instance the
//! chain runs strictly sequentially. Timer triggers call `submit_and_track`
//! on the policy's frequency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SchedError, SchedResult};
use crate::execution::JobEnvironment;
use crate::instance::{InstanceFilter, InstanceId, InstanceJob, PolicyInstance};
use crate::job::{JobStatus, ReplicationJobDetail};
use crate::persistence::StateStore;
use crate::policy::ReplicationPolicy;
use crate::retry::RetryController;
use crate::runner::{AttemptOutcome, ChainRunner};

/// Operations exposed to the policy-management layer.
#[async_trait]
pub trait PolicyScheduler: Send + Sync {
    /// Create an instance of a stored policy and start executing it.
    async fn submit_and_track(&self, policy_name: &str) -> SchedResult<InstanceId>;

    /// Current status of an instance.
    async fn status(&self, instance_id: &InstanceId) -> SchedResult<JobStatus>;

    /// Interrupt an instance. It ends `KILLED` and is not retried.
    async fn cancel(&self, instance_id: &InstanceId) -> SchedResult<()>;
}

struct RunningInstance {
    policy_name: String,
    cancel: CancellationToken,
}

struct Inner {
    env: JobEnvironment,
    runner: ChainRunner,
    retry: RetryController,
    running: RwLock<FxHashMap<InstanceId, RunningInstance>>,
    drivers: Mutex<JoinSet<()>>,
    triggers: RwLock<FxHashMap<String, JoinHandle<()>>>,
}

/// Scheduler executing policy instances against a copy engine.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ReplicationScheduler {
    inner: Arc<Inner>,
}

impl ReplicationScheduler {
    pub fn new(env: JobEnvironment) -> Self {
        let retry = RetryController::new(env.store.clone(), env.clock);
        Self {
            inner: Arc::new(Inner {
                runner: ChainRunner::new(env.clone()),
                retry,
                env,
                running: RwLock::new(FxHashMap::default()),
                drivers: Mutex::new(JoinSet::new()),
                triggers: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.env.store
    }

    pub fn environment(&self) -> &JobEnvironment {
        &self.inner.env
    }

    /// Validate and store a policy.
    pub async fn register_policy(&self, policy: &ReplicationPolicy) -> SchedResult<()> {
        policy.validate()?;
        self.store().save_policy(policy).await?;
        info!(policy = %policy.name, jobs = policy.jobs.len(), "Policy registered");
        Ok(())
    }

    async fn load_policy(&self, name: &str) -> SchedResult<ReplicationPolicy> {
        self.store()
            .load_policy(name)
            .await?
            .ok_or_else(|| SchedError::PolicyNotFound(name.to_string()))
    }

    async fn load_instance(&self, instance_id: &InstanceId) -> SchedResult<PolicyInstance> {
        self.store()
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| SchedError::InstanceNotFound(instance_id.to_string()))
    }

    /// Resume an instance a previous process left `RUNNING`.
    pub async fn resume(&self, instance_id: &InstanceId) -> SchedResult<()> {
        if self.inner.running.read().await.contains_key(instance_id) {
            return Err(SchedError::InconsistentState(format!(
                "instance {instance_id} is already being driven"
            )));
        }
        let instance = self.load_instance(instance_id).await?;
        let policy = self.load_policy(&instance.policy_name).await?;
        let chain = policy.chain()?;
        self.spawn_driver(instance_id.clone(), policy, chain, true)
            .await;
        Ok(())
    }

    async fn spawn_driver(
        &self,
        instance_id: InstanceId,
        policy: ReplicationPolicy,
        chain: Vec<ReplicationJobDetail>,
        resume: bool,
    ) {
        let cancel = CancellationToken::new();
        self.inner.running.write().await.insert(
            instance_id.clone(),
            RunningInstance {
                policy_name: policy.name.clone(),
                cancel: cancel.clone(),
            },
        );

        let inner = self.inner.clone();
        let mut drivers = self.inner.drivers.lock().await;
        while drivers.try_join_next().is_some() {}
        drivers.spawn(async move {
            inner.drive(instance_id, policy, chain, cancel, resume).await;
        });
    }

    /// Wait until an instance is terminal or nothing drives it any more.
    pub async fn wait(&self, instance_id: &InstanceId) -> SchedResult<PolicyInstance> {
        let poll = self.inner.env.settings.poll_interval();
        loop {
            let instance = self.load_instance(instance_id).await?;
            let driven = self.inner.running.read().await.contains_key(instance_id);
            if instance.terminal || !driven {
                return Ok(instance);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Check whether an instance of the policy is being driven.
    pub async fn is_policy_running(&self, policy_name: &str) -> bool {
        self.inner
            .running
            .read()
            .await
            .values()
            .any(|r| r.policy_name == policy_name)
    }

    /// Instances matching a filter, newest first.
    pub async fn list_instances(&self, filter: &InstanceFilter) -> SchedResult<Vec<PolicyInstance>> {
        self.store().list_instances(filter).await
    }

    /// Chain view of an instance.
    pub async fn instance_jobs(&self, instance_id: &InstanceId) -> SchedResult<Vec<InstanceJob>> {
        self.store().instance_jobs(instance_id).await
    }

    /// Fire the policy every `frequency_secs`, starting now.
    ///
    /// A firing is skipped while an instance of the policy is still being
    /// driven. Scheduling a policy again replaces its trigger.
    pub async fn schedule_policy(&self, policy_name: &str) -> SchedResult<()> {
        let policy = self.load_policy(policy_name).await?;
        if policy.frequency_secs == 0 {
            return Err(SchedError::ConfigError(format!(
                "policy {policy_name} has no frequency"
            )));
        }

        let scheduler = self.clone();
        let name = policy.name.clone();
        let period = policy.frequency();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if scheduler.is_policy_running(&name).await {
                    info!(policy = %name, "Previous instance still running, skipping trigger");
                    continue;
                }
                match scheduler.submit_and_track(&name).await {
                    Ok(id) => debug!(policy = %name, instance = %id, "Trigger fired"),
                    Err(e) => error!(policy = %name, "Trigger failed: {}", e),
                }
            }
        });

        if let Some(previous) = self
            .inner
            .triggers
            .write()
            .await
            .insert(policy.name.clone(), handle)
        {
            previous.abort();
        }
        info!(policy = %policy.name, period_secs = period.as_secs(), "Policy scheduled");
        Ok(())
    }

    /// Stop a policy's trigger. Returns whether one existed.
    pub async fn unschedule_policy(&self, policy_name: &str) -> bool {
        match self.inner.triggers.write().await.remove(policy_name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop triggers and drivers.
    ///
    /// Drivers are aborted, not cancelled: their instances stay `RUNNING`
    /// and their copy jobs keep running, so the next process recovers them.
    pub async fn shutdown(&self) {
        for (_, handle) in self.inner.triggers.write().await.drain() {
            handle.abort();
        }
        let mut drivers = self.inner.drivers.lock().await;
        drivers.shutdown().await;
        self.inner.running.write().await.clear();
        info!("Scheduler stopped");
    }

    /// Interval at which copy jobs and instances are polled.
    pub fn poll_interval(&self) -> Duration {
        self.inner.env.settings.poll_interval()
    }
}

impl Inner {
    async fn drive(
        self: Arc<Self>,
        instance_id: InstanceId,
        policy: ReplicationPolicy,
        chain: Vec<ReplicationJobDetail>,
        cancel: CancellationToken,
        mut resume: bool,
    ) {
        loop {
            let outcome = if resume {
                resume = false;
                self.runner
                    .resume(&instance_id, &chain, cancel.clone())
                    .await
            } else {
                self.attempt(&instance_id, &policy, &chain, &cancel).await
            };

            match outcome {
                Ok(outcome) if outcome.terminal => break,
                Ok(outcome) => {
                    warn!(
                        instance = %instance_id,
                        status = %outcome.status,
                        "Attempt failed: {}",
                        outcome.message
                    );
                }
                Err(SchedError::RetriesExhausted { .. }) => break,
                Err(SchedError::Cancelled(reason)) => {
                    self.abort(&instance_id, JobStatus::Killed, &reason).await;
                    break;
                }
                Err(e) => {
                    error!(
                        instance = %instance_id,
                        kind = %e.kind(),
                        "Instance driver stopped: {}",
                        e
                    );
                    self.abort(&instance_id, JobStatus::Failed, &e.to_string()).await;
                    break;
                }
            }
        }
        self.running.write().await.remove(&instance_id);
    }

    /// Close an instance its driver gave up on.
    async fn abort(&self, instance_id: &InstanceId, status: JobStatus, message: &str) {
        match self
            .env
            .store
            .abort_instance(instance_id, status, message, self.env.clock.now())
            .await
        {
            Ok(true) => info!(instance = %instance_id, status = %status, "Instance closed"),
            Ok(false) => {}
            Err(e) => error!(instance = %instance_id, "Failed to close instance: {}", e),
        }
    }

    async fn attempt(
        &self,
        instance_id: &InstanceId,
        policy: &ReplicationPolicy,
        chain: &[ReplicationJobDetail],
        cancel: &CancellationToken,
    ) -> SchedResult<AttemptOutcome> {
        let run_count = self.retry.admit(instance_id, &policy.retry, cancel).await?;
        self.runner
            .run_attempt(instance_id, chain, run_count, cancel.clone())
            .await
    }
}

#[async_trait]
impl PolicyScheduler for ReplicationScheduler {
    async fn submit_and_track(&self, policy_name: &str) -> SchedResult<InstanceId> {
        let policy = self.load_policy(policy_name).await?;
        let chain = policy.chain()?;
        let instance = self
            .store()
            .create_instance(&policy.name, &chain, self.inner.env.clock.now())
            .await?;
        info!(policy = %policy.name, instance = %instance.id, "Instance submitted");

        let id = instance.id;
        self.spawn_driver(id.clone(), policy, chain, false).await;
        Ok(id)
    }

    async fn status(&self, instance_id: &InstanceId) -> SchedResult<JobStatus> {
        Ok(self.load_instance(instance_id).await?.status)
    }

    async fn cancel(&self, instance_id: &InstanceId) -> SchedResult<()> {
        if let Some(running) = self.inner.running.read().await.get(instance_id) {
            info!(instance = %instance_id, "Cancelling instance");
            running.cancel.cancel();
            return Ok(());
        }

        let instance = self.load_instance(instance_id).await?;
        if instance.terminal {
            return Err(SchedError::InvalidTransition {
                instance_id: instance_id.to_string(),
                offset: instance.current_offset,
                from: instance.status.to_string(),
                to: JobStatus::Killed.to_string(),
            });
        }
        if instance.status == JobStatus::Running {
            // Left running by a process that went away
            self.store()
                .abort_instance(
                    instance_id,
                    JobStatus::Killed,
                    "cancelled",
                    self.inner.env.clock.now(),
                )
                .await?;
            return Ok(());
        }
        self.store()
            .close_instance(
                instance_id,
                JobStatus::Killed,
                "cancelled",
                self.inner.env.clock.now(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ferry_engine::sim::{SimOutcome, SimulatedEngine};
    use ferry_engine::FsRegistry;

    use crate::job::ReplicationType;
    use crate::persistence::SqliteStore;
    use crate::policy::RetryPolicy;
    use crate::replication::props;

    fn scheduler(engine: SimulatedEngine) -> (ReplicationScheduler, Arc<SimulatedEngine>) {
        let engine = Arc::new(engine);
        let env = JobEnvironment::new(
            engine.clone(),
            Arc::new(FsRegistry::new()),
            Arc::new(SqliteStore::in_memory().unwrap()),
        );
        (ReplicationScheduler::new(env), engine)
    }

    fn test_policy(name: &str, sleep_ms: u64) -> ReplicationPolicy {
        ReplicationPolicy::new(name)
            .with_job("t1", ReplicationType::Test, [(props::SLEEP_MILLIS, sleep_ms.to_string())])
            .with_retry(RetryPolicy::fixed(1, Duration::ZERO))
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_wait() {
        let (scheduler, _) = scheduler(SimulatedEngine::new());
        scheduler.register_policy(&test_policy("p1", 10)).await.unwrap();

        let id = scheduler.submit_and_track("p1").await.unwrap();
        assert_eq!(id.as_str(), "p1@1");
        let instance = scheduler.wait(&id).await.unwrap();
        assert_eq!(instance.status, JobStatus::Success);
        assert_eq!(instance.run_count, 1);
        assert_eq!(scheduler.status(&id).await.unwrap(), JobStatus::Success);

        let jobs = scheduler.instance_jobs(&id).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Success));
    }

    #[tokio::test]
    async fn test_unknown_policy() {
        let (scheduler, _) = scheduler(SimulatedEngine::new());
        assert!(matches!(
            scheduler.submit_and_track("missing").await,
            Err(SchedError::PolicyNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_instance() {
        let (scheduler, engine) = scheduler(SimulatedEngine::new());
        engine.script([SimOutcome::Hang]);
        let policy = ReplicationPolicy::new("p1")
            .with_job("a", ReplicationType::Hdfs, [(props::SOURCE_DATASET, "/apps/dr".to_string())])
            .with_retry(RetryPolicy::fixed(3, Duration::ZERO));
        scheduler.register_policy(&policy).await.unwrap();

        let id = scheduler.submit_and_track("p1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.cancel(&id).await.unwrap();

        let instance = scheduler.wait(&id).await.unwrap();
        assert_eq!(instance.status, JobStatus::Killed);
        assert!(instance.terminal);
        assert_eq!(instance.run_count, 1);
        assert_eq!(engine.kills(), 1);
        assert_eq!(engine.submissions(), 1);

        assert!(matches!(
            scheduler.cancel(&id).await,
            Err(SchedError::InvalidTransition { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_skips_while_running() {
        let (scheduler, _) = scheduler(SimulatedEngine::new());
        let policy = test_policy("p1", 25_000).with_frequency(Duration::from_secs(10));
        scheduler.register_policy(&policy).await.unwrap();
        scheduler.schedule_policy("p1").await.unwrap();

        // Fires at 0s and 30s; the firings at 10s and 20s are skipped
        tokio::time::sleep(Duration::from_secs(35)).await;
        scheduler.shutdown().await;

        let instances = scheduler
            .list_instances(&InstanceFilter::all().with_policy("p1"))
            .await
            .unwrap();
        assert_eq!(instances.len(), 2);
        assert!(!scheduler.unschedule_policy("p1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_instance_running() {
        let (scheduler, _) = scheduler(SimulatedEngine::new());
        scheduler
            .register_policy(&test_policy("p1", 60_000))
            .await
            .unwrap();
        let id = scheduler.submit_and_track("p1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        scheduler.shutdown().await;
        assert_eq!(scheduler.status(&id).await.unwrap(), JobStatus::Running);
        assert!(!scheduler.is_policy_running("p1").await);
    }
}
