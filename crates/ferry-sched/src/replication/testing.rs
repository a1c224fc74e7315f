//! `TEST` jobs: no external work, configurable delay and failure.

use std::time::Duration;

use tracing::debug;

use super::props;
use crate::error::{SchedError, SchedResult};
use crate::execution::{RecoveryOutcome, ReplicationJob};
use crate::job::{Completion, JobContext, ReplicationJobDetail};

/// Test strategy.
///
/// `sleepMillis` delays `perform`, which stays interruptible; `failWith`
/// makes it fail with the given message.
pub struct TestReplication {
    detail: ReplicationJobDetail,
    sleep: Duration,
    fail_with: Option<String>,
}

impl TestReplication {
    pub fn new(detail: ReplicationJobDetail) -> Self {
        Self {
            detail,
            sleep: Duration::ZERO,
            fail_with: None,
        }
    }
}

#[async_trait::async_trait]
impl ReplicationJob for TestReplication {
    fn detail(&self) -> &ReplicationJobDetail {
        &self.detail
    }

    async fn init(&mut self, _ctx: &mut JobContext) -> SchedResult<()> {
        self.sleep = Duration::from_millis(
            self.detail
                .parsed::<u64>(props::SLEEP_MILLIS)?
                .unwrap_or(0),
        );
        self.fail_with = self.detail.property(props::FAIL_WITH).map(str::to_string);
        Ok(())
    }

    async fn perform(&mut self, ctx: &mut JobContext) -> SchedResult<Completion> {
        if !self.sleep.is_zero() {
            let cancel = ctx.cancellation().clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(SchedError::Cancelled(format!(
                        "test job {} interrupted",
                        self.detail.identifier()
                    )));
                }
                _ = tokio::time::sleep(self.sleep) => {}
            }
        }
        if let Some(message) = &self.fail_with {
            return Err(SchedError::JobFailed(message.clone()));
        }
        debug!(job = %self.detail.identifier(), instance = %ctx.instance_id, "Test job done");
        Ok(Completion::success())
    }

    async fn cleanup(&mut self, _ctx: &mut JobContext) -> SchedResult<()> {
        Ok(())
    }

    async fn recover(&mut self, _ctx: &mut JobContext) -> SchedResult<RecoveryOutcome> {
        Ok(RecoveryOutcome::NotLaunched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceId;
    use crate::job::ReplicationType;
    use rustc_hash::FxHashMap;
    use tokio_util::sync::CancellationToken;

    fn job(props: &[(&str, &str)]) -> TestReplication {
        let props: FxHashMap<String, String> = props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TestReplication::new(ReplicationJobDetail::new(
            "t1",
            "p1",
            ReplicationType::Test,
            Some(props),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_interruptible() {
        let mut job = job(&[(props::SLEEP_MILLIS, "60000")]);
        let cancel = CancellationToken::new();
        let mut ctx = JobContext::new(InstanceId::new("p1", 1), 1, cancel.clone());
        job.init(&mut ctx).await.unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let err = job.perform(&mut ctx).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, SchedError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_fail_with() {
        let mut job = job(&[(props::FAIL_WITH, "boom")]);
        let mut ctx = JobContext::new(InstanceId::new("p1", 1), 1, CancellationToken::new());
        job.init(&mut ctx).await.unwrap();
        assert!(matches!(
            job.perform(&mut ctx).await,
            Err(SchedError::JobFailed(m)) if m == "boom"
        ));
        assert_eq!(job.recover(&mut ctx).await.unwrap(), RecoveryOutcome::NotLaunched);
    }
}
