//! Hive replication: copies a database's warehouse directory.

use tracing::debug;

use super::copy::{ensure_success, reattach, run_copy, Reattached};
use super::{copy_options, endpoints, props};
use crate::error::SchedResult;
use crate::execution::{JobEnvironment, RecoveryOutcome, ReplicationJob};
use crate::job::{Completion, JobContext, ReplicationJobDetail};
use crate::metrics::MetricsJobType;

/// Warehouse root a database lives under when no dataset is given.
pub const WAREHOUSE_ROOT: &str = "/apps/hive/warehouse";

/// Hive replication strategy.
pub struct HiveReplication {
    detail: ReplicationJobDetail,
    env: JobEnvironment,
    source: String,
    target: String,
}

impl HiveReplication {
    pub fn new(detail: ReplicationJobDetail, env: JobEnvironment) -> Self {
        Self {
            detail,
            env,
            source: String::new(),
            target: String::new(),
        }
    }
}

fn non_blank<'a>(detail: &'a ReplicationJobDetail, key: &str) -> Option<&'a str> {
    detail.property(key).filter(|v| !v.trim().is_empty())
}

#[async_trait::async_trait]
impl ReplicationJob for HiveReplication {
    fn detail(&self) -> &ReplicationJobDetail {
        &self.detail
    }

    async fn init(&mut self, _ctx: &mut JobContext) -> SchedResult<()> {
        let database = self.detail.required(props::SOURCE_DATABASE)?;
        let source_dataset = match non_blank(&self.detail, props::SOURCE_DATASET) {
            Some(dataset) => dataset.to_string(),
            None => format!("{WAREHOUSE_ROOT}/{}.db", database.trim()),
        };
        let target_dataset = non_blank(&self.detail, props::TARGET_DATASET)
            .map(str::to_string)
            .unwrap_or_else(|| source_dataset.clone());

        let (source, target) = endpoints(&self.detail, &source_dataset, &target_dataset)?;
        debug!(job = %self.detail.identifier(), %source, %target, "Hive replication initialized");
        self.source = source;
        self.target = target;
        Ok(())
    }

    async fn perform(&mut self, ctx: &mut JobContext) -> SchedResult<Completion> {
        let options = copy_options(&self.detail, &self.source, &self.target)?;
        let report = run_copy(&self.env, ctx, &options, MetricsJobType::Main).await?;
        ensure_success(&report)?;
        Ok(Completion::success())
    }

    async fn cleanup(&mut self, _ctx: &mut JobContext) -> SchedResult<()> {
        Ok(())
    }

    async fn recover(&mut self, ctx: &mut JobContext) -> SchedResult<RecoveryOutcome> {
        Ok(match reattach(&self.env, ctx).await? {
            Reattached::NotLaunched => RecoveryOutcome::NotLaunched,
            Reattached::Succeeded { .. } => RecoveryOutcome::Completed(Completion::success()),
            Reattached::Ended { report, .. } => RecoveryOutcome::Failed(format!(
                "copy job {} ended in state {}",
                report.job_id, report.state
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use ferry_engine::sim::SimulatedEngine;
    use ferry_engine::{CopyJobId, FsRegistry, RunState};
    use rustc_hash::FxHashMap;
    use tokio_util::sync::CancellationToken;

    use crate::chain::build_chain;
    use crate::error::SchedError;
    use crate::job::ReplicationType;
    use crate::metrics::ReplicationMetrics;
    use crate::persistence::{SqliteStore, StateStore};

    fn detail(props: &[(&str, &str)]) -> ReplicationJobDetail {
        let props: FxHashMap<String, String> = props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ReplicationJobDetail::new("sales", "p1", ReplicationType::Hive, Some(props))
    }

    async fn setup(
        d: &ReplicationJobDetail,
        engine: Arc<SimulatedEngine>,
    ) -> (JobEnvironment, JobContext) {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let chain = build_chain(std::slice::from_ref(d)).unwrap();
        let instance = store.create_instance("p1", &chain, Utc::now()).await.unwrap();
        let env = JobEnvironment::new(engine, Arc::new(FsRegistry::new()), store);
        let mut ctx = JobContext::new(instance.id, 0, CancellationToken::new());
        ctx.advance_to(1);
        (env, ctx)
    }

    #[tokio::test]
    async fn test_copies_warehouse_directory() {
        let engine = Arc::new(SimulatedEngine::new());
        let d = detail(&[
            (props::SOURCE_DATABASE, "sales"),
            (props::SOURCE_NN, "hdfs://src:8020"),
            (props::TARGET_NN, "hdfs://tgt:8020"),
            (props::QUEUE_NAME, "dr"),
        ]);
        let (env, mut ctx) = setup(&d, engine.clone()).await;

        let mut job = HiveReplication::new(d, env);
        job.init(&mut ctx).await.unwrap();
        assert_eq!(job.perform(&mut ctx).await.unwrap(), Completion::success());

        let submitted = engine.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].source, "hdfs://src:8020/apps/hive/warehouse/sales.db");
        assert_eq!(submitted[0].target, "hdfs://tgt:8020/apps/hive/warehouse/sales.db");
        assert_eq!(submitted[0].queue.as_deref(), Some("dr"));
        assert!(!submitted[0].is_snapshot_diff());
    }

    #[tokio::test]
    async fn test_requires_database() {
        let d = detail(&[(props::SOURCE_DATASET, "/data/sales")]);
        let (env, mut ctx) = setup(&d, Arc::new(SimulatedEngine::new())).await;
        let mut job = HiveReplication::new(d, env);
        let err = job.init(&mut ctx).await.unwrap_err();
        assert!(matches!(err, SchedError::MissingProperty { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_recover_reports_failed_copy() {
        let engine = Arc::new(SimulatedEngine::new());
        engine.seed_job("job_hive_0001", RunState::Killed);
        let d = detail(&[(props::SOURCE_DATABASE, "sales")]);
        let (env, mut ctx) = setup(&d, engine.clone()).await;
        env.store
            .record_metrics(
                &ctx.instance_id,
                &ReplicationMetrics::launched(&CopyJobId::new("job_hive_0001"), MetricsJobType::Main),
            )
            .await
            .unwrap();

        let mut job = HiveReplication::new(d, env);
        job.init(&mut ctx).await.unwrap();
        let outcome = job.recover(&mut ctx).await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Failed(m) if m.contains("job_hive_0001")));
        assert_eq!(engine.submissions(), 0);
    }
}
