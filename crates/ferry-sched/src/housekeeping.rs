//! Periodic store maintenance.
//!
//! A [`HousekeepingPool`] is sized once from the configured thread count;
//! at most that many tasks run at the same time. Each scheduled task runs
//! with a fixed delay between the end of one run and the start of the next.
//! A failed run is logged and the schedule continues.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::HousekeepingConfig;
use crate::error::{SchedError, SchedResult};
use crate::persistence::StateStore;

/// A maintenance task.
#[async_trait]
pub trait HousekeepingTask: Send + Sync {
    fn name(&self) -> &str;

    /// Run once. Returns the number of affected instances.
    async fn run(&self, store: &dyn StateStore, now: DateTime<Utc>) -> SchedResult<usize>;
}

fn age(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}

fn cutoff(now: DateTime<Utc>, age: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Retires terminal instances that ended more than the grace period ago.
pub struct RetireCompleted {
    grace: chrono::Duration,
}

impl RetireCompleted {
    pub fn new(grace_secs: u64) -> Self {
        Self {
            grace: age(grace_secs),
        }
    }
}

#[async_trait]
impl HousekeepingTask for RetireCompleted {
    fn name(&self) -> &str {
        "retire-completed"
    }

    async fn run(&self, store: &dyn StateStore, now: DateTime<Utc>) -> SchedResult<usize> {
        store.retire_completed_before(cutoff(now, self.grace), now).await
    }
}

/// Deletes instances retired more than the purge age ago.
pub struct PurgeRetired {
    age: chrono::Duration,
}

impl PurgeRetired {
    pub fn new(age_secs: u64) -> Self {
        Self { age: age(age_secs) }
    }
}

#[async_trait]
impl HousekeepingTask for PurgeRetired {
    fn name(&self) -> &str {
        "purge-retired"
    }

    async fn run(&self, store: &dyn StateStore, now: DateTime<Utc>) -> SchedResult<usize> {
        store.purge_retired_before(cutoff(now, self.age)).await
    }
}

/// The built-in tasks for a configuration.
pub fn builtin_tasks(config: &HousekeepingConfig) -> Vec<Arc<dyn HousekeepingTask>> {
    vec![
        Arc::new(RetireCompleted::new(config.retire_grace_secs)),
        Arc::new(PurgeRetired::new(config.purge_age_secs)),
    ]
}

/// Fixed-size pool running housekeeping tasks.
pub struct HousekeepingPool {
    store: Arc<dyn StateStore>,
    clock: Clock,
    threads: usize,
    permits: Arc<Semaphore>,
    scheduled: Mutex<Vec<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl HousekeepingPool {
    pub fn new(store: Arc<dyn StateStore>, clock: Clock, threads: usize) -> Self {
        let threads = threads.max(1);
        Self {
            store,
            clock,
            threads,
            permits: Arc::new(Semaphore::new(threads)),
            scheduled: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run a task once on a pool slot.
    pub async fn run_once(&self, task: &dyn HousekeepingTask) -> SchedResult<usize> {
        execute(&self.permits, self.store.as_ref(), self.clock, task).await
    }

    /// Run a task after `initial_delay`, then again `delay` after each run
    /// finished, until the pool is shut down.
    pub fn schedule_with_fixed_delay(
        &self,
        task: Arc<dyn HousekeepingTask>,
        initial_delay: Duration,
        delay: Duration,
    ) {
        let permits = self.permits.clone();
        let store = self.store.clone();
        let clock = self.clock;
        let stop = self.stop.clone();

        let handle = tokio::spawn(async move {
            let mut pause = initial_delay;
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
                if let Err(e) = execute(&permits, store.as_ref(), clock, task.as_ref()).await {
                    warn!(task = task.name(), "Housekeeping run failed: {}", e);
                }
                pause = delay;
            }
            debug!(task = task.name(), "Housekeeping task stopped");
        });

        self.scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Stop every scheduled task and wait for running ones to finish.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handles: Vec<_> = self
            .scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Housekeeping task ended abnormally: {}", e);
            }
        }
    }
}

async fn execute(
    permits: &Semaphore,
    store: &dyn StateStore,
    clock: Clock,
    task: &dyn HousekeepingTask,
) -> SchedResult<usize> {
    let _permit = permits
        .acquire()
        .await
        .map_err(|e| SchedError::Internal(format!("housekeeping pool closed: {e}")))?;
    let affected = task.run(store, clock.now()).await?;
    if affected > 0 {
        info!(task = task.name(), affected, "Housekeeping run finished");
    } else {
        debug!(task = task.name(), "Housekeeping run found nothing to do");
    }
    Ok(affected)
}
