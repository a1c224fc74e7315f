//! Retry and backoff control.
//!
//! Before every attempt the controller decides from the stored instance
//! whether the instance may run again:
//!
//! ```text
//!   run_count + 1 > max_attempts ──→ close FAILED, nothing launched
//!   run_count == 0               ──→ launch
//!   delay not yet elapsed        ──→ wait, then decide again
//!   otherwise                    ──→ launch (run_count + 1)
//! ```
//!
//! The delay is measured from the end of the previous attempt. `KILLED`
//! attempts count against the budget like failed ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::error::{SchedError, SchedResult};
use crate::instance::{InstanceId, PolicyInstance};
use crate::job::JobStatus;
use crate::persistence::StateStore;
use crate::policy::RetryPolicy;
use crate::runner::resume_offset;

/// What the controller does with an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Open the next attempt now.
    Launch,
    /// Open the next attempt after the delay.
    Wait(Duration),
    /// The budget is used up.
    Exhausted,
    /// The instance finished for good.
    Done,
    /// An attempt is running.
    InFlight,
}

/// Decide what to do with an instance at `now`.
pub fn decide(instance: &PolicyInstance, retry: &RetryPolicy, now: DateTime<Utc>) -> RetryDecision {
    if instance.terminal || instance.status == JobStatus::Success {
        return RetryDecision::Done;
    }
    if instance.status == JobStatus::Running {
        return RetryDecision::InFlight;
    }
    if instance.run_count.saturating_add(1) > retry.max_attempts {
        return RetryDecision::Exhausted;
    }
    if instance.run_count == 0 {
        return RetryDecision::Launch;
    }

    let delay = retry.delay_after(instance.run_count);
    let Some(ended) = instance.end_time else {
        return RetryDecision::Launch;
    };
    let elapsed = (now - ended).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= delay {
        RetryDecision::Launch
    } else {
        RetryDecision::Wait(delay - elapsed)
    }
}

/// Opens attempts within a policy's retry budget.
#[derive(Clone)]
pub struct RetryController {
    store: Arc<dyn StateStore>,
    clock: Clock,
}

impl RetryController {
    pub fn new(store: Arc<dyn StateStore>, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// Wait until the next attempt may start and open it.
    ///
    /// Returns the run count of the new attempt. When the budget is used up
    /// the instance is closed `FAILED` and [`SchedError::RetriesExhausted`]
    /// is returned; the copy engine is never contacted.
    pub async fn admit(
        &self,
        instance_id: &InstanceId,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> SchedResult<u32> {
        loop {
            let instance = self
                .store
                .load_instance(instance_id)
                .await?
                .ok_or_else(|| SchedError::InstanceNotFound(instance_id.to_string()))?;

            match decide(&instance, retry, self.clock.now()) {
                RetryDecision::Launch => {
                    let jobs = self.store.instance_jobs(instance_id).await?;
                    let offset = resume_offset(&jobs);
                    let run_count = self
                        .store
                        .increment_run_count(instance_id, offset, instance.run_count, self.clock.now())
                        .await?;
                    debug!(instance = %instance_id, run_count, offset, "Attempt admitted");
                    return Ok(run_count);
                }
                RetryDecision::Wait(delay) => {
                    info!(
                        instance = %instance_id,
                        attempt = instance.run_count + 1,
                        delay_secs = delay.as_secs_f64(),
                        "Waiting before retry"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(SchedError::Cancelled(format!(
                                "retry of {instance_id} cancelled"
                            )));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::Exhausted => {
                    let err = SchedError::RetriesExhausted {
                        instance_id: instance_id.to_string(),
                        attempts: instance.run_count,
                    };
                    let message = match &instance.message {
                        Some(last) => format!("{err}; last failure: {last}"),
                        None => err.to_string(),
                    };
                    self.store
                        .close_instance(instance_id, JobStatus::Failed, &message, self.clock.now())
                        .await?;
                    error!(instance = %instance_id, attempts = instance.run_count, "Retries exhausted");
                    return Err(err);
                }
                RetryDecision::Done | RetryDecision::InFlight => {
                    return Err(SchedError::InvalidTransition {
                        instance_id: instance_id.to_string(),
                        offset: instance.current_offset,
                        from: instance.status.to_string(),
                        to: JobStatus::Running.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    use crate::chain::build_chain;
    use crate::job::{ReplicationJobDetail, ReplicationType};
    use crate::persistence::SqliteStore;

    fn instance(status: JobStatus, run_count: u32, end_time: Option<DateTime<Utc>>) -> PolicyInstance {
        PolicyInstance {
            id: InstanceId::new("p1", 1),
            policy_name: "p1".into(),
            status,
            run_count,
            current_offset: 1,
            message: None,
            created_at: Utc::now(),
            start_time: None,
            end_time,
            terminal: false,
            retirement_time: None,
        }
    }

    #[test]
    fn test_decide() {
        let retry = RetryPolicy::fixed(3, Duration::from_secs(60));
        let now = Utc::now();

        assert_eq!(
            decide(&instance(JobStatus::NotStarted, 0, None), &retry, now),
            RetryDecision::Launch
        );
        assert_eq!(
            decide(&instance(JobStatus::Running, 1, None), &retry, now),
            RetryDecision::InFlight
        );
        assert_eq!(
            decide(&instance(JobStatus::Success, 1, Some(now)), &retry, now),
            RetryDecision::Done
        );

        let failed = instance(JobStatus::Failed, 1, Some(now - ChronoDuration::seconds(20)));
        assert_eq!(
            decide(&failed, &retry, now),
            RetryDecision::Wait(Duration::from_secs(40))
        );
        assert_eq!(
            decide(&failed, &retry, now + ChronoDuration::seconds(40)),
            RetryDecision::Launch
        );

        let killed = instance(JobStatus::Killed, 3, Some(now));
        assert_eq!(decide(&killed, &retry, now), RetryDecision::Exhausted);
    }

    async fn failed_attempt(store: &Arc<dyn StateStore>, id: &InstanceId, run_count: u32) -> u32 {
        let next = store
            .increment_run_count(id, 1, run_count, Utc::now())
            .await
            .unwrap();
        let now = Utc::now();
        store.record_start(id, 1, next, now).await.unwrap();
        store
            .record_completion(id, 1, next, JobStatus::Failed, "copy failed", now, None)
            .await
            .unwrap();
        store
            .finish_attempt(id, next, JobStatus::Failed, "copy failed", now, false)
            .await
            .unwrap();
        next
    }

    #[tokio::test]
    async fn test_exhausted_without_launch() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let chain = build_chain(&[ReplicationJobDetail::new(
            "t",
            "p1",
            ReplicationType::Test,
            None,
        )])
        .unwrap();
        let created = store.create_instance("p1", &chain, Utc::now()).await.unwrap();
        let id = created.id;

        // Offset 0 succeeded in the first attempt
        let first = store.increment_run_count(&id, 0, 0, Utc::now()).await.unwrap();
        let now = Utc::now();
        store.record_start(&id, 0, first, now).await.unwrap();
        store
            .record_completion(&id, 0, first, JobStatus::Success, "SUCCESS", now, None)
            .await
            .unwrap();
        store.record_start(&id, 1, first, now).await.unwrap();
        store
            .record_completion(&id, 1, first, JobStatus::Failed, "copy failed", now, None)
            .await
            .unwrap();
        store
            .finish_attempt(&id, first, JobStatus::Failed, "copy failed", now, false)
            .await
            .unwrap();
        let second = failed_attempt(&store, &id, first).await;
        let third = failed_attempt(&store, &id, second).await;
        assert_eq!(third, 3);

        let controller = RetryController::new(store.clone(), Clock::new());
        let retry = RetryPolicy::fixed(3, Duration::ZERO);
        let err = controller
            .admit(&id, &retry, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::RetriesExhausted { attempts: 3, .. }));

        let instance = store.load_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.status, JobStatus::Failed);
        assert_eq!(instance.run_count, 3);
        assert!(instance.terminal);
        assert!(instance.message.unwrap().contains("copy failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_waits_for_delay() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let chain = build_chain(&[ReplicationJobDetail::new(
            "t",
            "p1",
            ReplicationType::Test,
            None,
        )])
        .unwrap();
        let id = store.create_instance("p1", &chain, Utc::now()).await.unwrap().id;
        let clock = Clock::new();
        let controller = RetryController::new(store.clone(), clock);
        let retry = RetryPolicy::fixed(2, Duration::from_secs(5));
        let cancel = CancellationToken::new();

        assert_eq!(controller.admit(&id, &retry, &cancel).await.unwrap(), 1);
        let now = clock.now();
        store.record_start(&id, 0, 1, now).await.unwrap();
        store
            .record_completion(&id, 0, 1, JobStatus::Failed, "boom", now, None)
            .await
            .unwrap();
        store
            .finish_attempt(&id, 1, JobStatus::Failed, "boom", now, false)
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        assert_eq!(controller.admit(&id, &retry, &cancel).await.unwrap(), 2);
        assert!(start.elapsed() >= Duration::from_secs(4));
    }
}
