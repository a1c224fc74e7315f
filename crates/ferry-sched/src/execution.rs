//! Job execution contract.
//!
//! Every job of a chain runs through the same lifecycle:
//!
//! ```text
//!   init ──→ perform ──→ cleanup          (fresh execution)
//!   init ──→ recover ──→ cleanup          (resumed after an interruption)
//! ```
//!
//! `cleanup` runs on every exit path once `init` was entered, including a
//! failed `init`, so implementations must tolerate partially acquired
//! resources.

use std::sync::Arc;

use async_trait::async_trait;
use ferry_engine::{CopyEngine, FsRegistry};

use crate::clock::Clock;
use crate::config::ExecutionConfig;
use crate::error::SchedResult;
use crate::job::{Completion, JobContext, ReplicationJobDetail};
use crate::persistence::StateStore;

/// Result of resuming an interrupted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No external work was ever launched; run `perform` from scratch.
    NotLaunched,
    /// The interrupted work finished successfully.
    Completed(Completion),
    /// The interrupted work cannot be completed in this attempt.
    Failed(String),
}

/// A replication strategy bound to one job descriptor.
#[async_trait]
pub trait ReplicationJob: Send {
    /// Descriptor this job executes.
    fn detail(&self) -> &ReplicationJobDetail;

    /// Acquire resources and resolve source and target addresses.
    async fn init(&mut self, ctx: &mut JobContext) -> SchedResult<()>;

    /// Run the replication, blocking until the external work finished.
    async fn perform(&mut self, ctx: &mut JobContext) -> SchedResult<Completion>;

    /// Release what `init` acquired.
    async fn cleanup(&mut self, ctx: &mut JobContext) -> SchedResult<()>;

    /// Resume after an interruption.
    async fn recover(&mut self, ctx: &mut JobContext) -> SchedResult<RecoveryOutcome>;
}

/// Collaborators shared by every job of a scheduler.
#[derive(Clone)]
pub struct JobEnvironment {
    pub engine: Arc<dyn CopyEngine>,
    pub filesystems: Arc<FsRegistry>,
    pub store: Arc<dyn StateStore>,
    pub settings: ExecutionConfig,
    pub clock: Clock,
}

impl JobEnvironment {
    pub fn new(
        engine: Arc<dyn CopyEngine>,
        filesystems: Arc<FsRegistry>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            engine,
            filesystems,
            store,
            settings: ExecutionConfig::default(),
            clock: Clock::new(),
        }
    }

    /// Replace the execution settings.
    pub fn with_settings(mut self, settings: ExecutionConfig) -> Self {
        self.settings = settings;
        self
    }
}

/// The START and END markers of a chain. No-op in every phase.
pub struct SentinelNode {
    detail: ReplicationJobDetail,
}

impl SentinelNode {
    pub fn new(detail: ReplicationJobDetail) -> Self {
        Self { detail }
    }
}

#[async_trait]
impl ReplicationJob for SentinelNode {
    fn detail(&self) -> &ReplicationJobDetail {
        &self.detail
    }

    async fn init(&mut self, _ctx: &mut JobContext) -> SchedResult<()> {
        Ok(())
    }

    async fn perform(&mut self, _ctx: &mut JobContext) -> SchedResult<Completion> {
        Ok(Completion::success())
    }

    async fn cleanup(&mut self, _ctx: &mut JobContext) -> SchedResult<()> {
        Ok(())
    }

    async fn recover(&mut self, _ctx: &mut JobContext) -> SchedResult<RecoveryOutcome> {
        Ok(RecoveryOutcome::Completed(Completion::success()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{build_chain, START_NODE};
    use crate::instance::InstanceId;
    use crate::job::ReplicationType;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_sentinel_is_noop() {
        let chain = build_chain(&[ReplicationJobDetail::new(
            "t",
            "p1",
            ReplicationType::Test,
            None,
        )])
        .unwrap();
        let mut node = SentinelNode::new(chain[0].clone());
        let mut ctx = JobContext::new(InstanceId::new("p1", 1), 1, CancellationToken::new());

        assert_eq!(node.detail().identifier(), START_NODE);
        node.init(&mut ctx).await.unwrap();
        assert_eq!(node.perform(&mut ctx).await.unwrap(), Completion::success());
        node.cleanup(&mut ctx).await.unwrap();
        assert_eq!(
            node.recover(&mut ctx).await.unwrap(),
            RecoveryOutcome::Completed(Completion::success())
        );
        assert!(ctx.recovery_context.is_none());
    }
}
