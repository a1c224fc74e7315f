//! Replication metrics and the periodic collector.
//!
//! While `perform` blocks on the copy engine, a [`MetricsCollector`] task
//! samples the engine's counters and writes them to the instance's
//! tracking info through the store. The collector shares nothing else with
//! the blocked worker and is aborted on every exit path of the wait.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ferry_engine::{
    CopyEngine, CopyJobId, CopyJobReport, JOB_COUNTER_GROUP, NUM_COMPLETED_MAPS, NUM_FAILED_MAPS,
    NUM_KILLED_MAPS, TOTAL_LAUNCHED_MAPS,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{SchedError, SchedResult};
use crate::instance::InstanceId;
use crate::persistence::StateStore;

/// Role of a copy job within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricsJobType {
    /// The copy launched by `perform`.
    Main,
    /// The delta copy launched by recovery.
    Recovery,
}

impl MetricsJobType {
    pub fn name(&self) -> &'static str {
        match self {
            MetricsJobType::Main => "MAIN",
            MetricsJobType::Recovery => "RECOVERY",
        }
    }
}

impl std::fmt::Display for MetricsJobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Progress counters of one copy job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMetrics {
    pub job_id: String,
    pub job_type: MetricsJobType,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub killed_tasks: u64,
    /// Milliseconds since the copy job started.
    pub time_taken: u64,
}

impl ReplicationMetrics {
    /// Entry recorded right after submission, before any counters exist.
    pub fn launched(job_id: &CopyJobId, job_type: MetricsJobType) -> Self {
        Self {
            job_id: job_id.to_string(),
            job_type,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            killed_tasks: 0,
            time_taken: 0,
        }
    }

    /// Translate an engine report. Missing counter groups count as zero.
    pub fn from_report(report: &CopyJobReport, job_type: MetricsJobType) -> Self {
        let counter = |name: &str| report.counters.get(JOB_COUNTER_GROUP, name).unwrap_or(0);
        Self {
            job_id: report.job_id.to_string(),
            job_type,
            total_tasks: counter(TOTAL_LAUNCHED_MAPS),
            completed_tasks: counter(NUM_COMPLETED_MAPS),
            failed_tasks: counter(NUM_FAILED_MAPS),
            killed_tasks: counter(NUM_KILLED_MAPS),
            time_taken: report.elapsed_ms(Utc::now()),
        }
    }

    /// Engine identifier of the copy job.
    pub fn copy_job_id(&self) -> CopyJobId {
        CopyJobId::new(self.job_id.clone())
    }
}

/// Metrics of the copy jobs of the current attempt.
///
/// Holds at most one MAIN entry followed by at most one RECOVERY entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingInfo {
    entries: Vec<ReplicationMetrics>,
}

impl TrackingInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, MAIN first.
    pub fn entries(&self) -> &[ReplicationMetrics] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check whether recovery has launched a copy in this attempt.
    pub fn has_recovery(&self) -> bool {
        self.entries.len() > 1
    }

    /// Entry of the job that currently matters: the RECOVERY job once one
    /// exists, otherwise the MAIN job.
    pub fn current(&self) -> Option<&ReplicationMetrics> {
        self.entries.last()
    }

    /// Insert or overwrite the entry of a copy job.
    ///
    /// Fails when the slot for the job type is taken by a different job:
    /// a second RECOVERY job is a [`SchedError::RecoveryLimit`].
    pub fn record(&mut self, metrics: ReplicationMetrics) -> SchedResult<()> {
        let slot = match metrics.job_type {
            MetricsJobType::Main => 0,
            MetricsJobType::Recovery => 1,
        };

        if let Some(existing) = self.entries.get_mut(slot) {
            if existing.job_id != metrics.job_id {
                return Err(match metrics.job_type {
                    MetricsJobType::Recovery => SchedError::RecoveryLimit(format!(
                        "recovery job {} already recorded, refusing {}",
                        existing.job_id, metrics.job_id
                    )),
                    MetricsJobType::Main => SchedError::InconsistentState(format!(
                        "main job {} already recorded, refusing {}",
                        existing.job_id, metrics.job_id
                    )),
                });
            }
            *existing = metrics;
            return Ok(());
        }

        if slot != self.entries.len() {
            return Err(SchedError::InconsistentState(format!(
                "recovery job {} recorded without a main job",
                metrics.job_id
            )));
        }
        self.entries.push(metrics);
        Ok(())
    }

    pub fn to_json(&self) -> SchedResult<String> {
        Ok(serde_json::to_string(&self.entries)?)
    }

    pub fn from_json(json: &str) -> SchedResult<Self> {
        Ok(Self {
            entries: serde_json::from_str(json)?,
        })
    }
}

/// Sample a copy job once and persist its metrics.
///
/// Returns `None` when the engine does not resolve the job yet.
pub async fn collect_once(
    store: &dyn StateStore,
    engine: &dyn CopyEngine,
    instance_id: &InstanceId,
    job_id: &CopyJobId,
    job_type: MetricsJobType,
) -> SchedResult<Option<ReplicationMetrics>> {
    let Some(report) = engine.lookup(job_id).await? else {
        return Ok(None);
    };
    let metrics = ReplicationMetrics::from_report(&report, job_type);
    store.record_metrics(instance_id, &metrics).await?;
    Ok(Some(metrics))
}

/// Periodic metrics sampler for one copy job.
///
/// The background task is aborted by [`MetricsCollector::stop`] or when the
/// collector is dropped.
pub struct MetricsCollector {
    handle: JoinHandle<()>,
}

impl MetricsCollector {
    /// Start sampling `job_id` every `every`.
    pub fn start(
        store: Arc<dyn StateStore>,
        engine: Arc<dyn CopyEngine>,
        instance_id: InstanceId,
        job_id: CopyJobId,
        job_type: MetricsJobType,
        every: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match collect_once(
                    store.as_ref(),
                    engine.as_ref(),
                    &instance_id,
                    &job_id,
                    job_type,
                )
                .await
                {
                    Ok(Some(m)) => debug!(
                        instance = %instance_id,
                        copy_job = %job_id,
                        completed = m.completed_tasks,
                        total = m.total_tasks,
                        "Captured replication metrics"
                    ),
                    Ok(None) => debug!(copy_job = %job_id, "Copy job not visible yet"),
                    Err(e) => warn!(
                        instance = %instance_id,
                        copy_job = %job_id,
                        "Failed to capture replication metrics: {}",
                        e
                    ),
                }
            }
        });
        Self { handle }
    }

    /// Stop sampling.
    ///
    /// Returns once the sampling task is gone, so no sample lands after it.
    pub async fn stop(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }

    /// Check whether the sampling task has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_engine::sim::{SimOutcome, SimulatedEngine};
    use ferry_engine::{CopyCounters, CopyOptions, RunState};

    use crate::chain::build_chain;
    use crate::job::{ReplicationJobDetail, ReplicationType};
    use crate::persistence::SqliteStore;

    fn metrics(job_id: &str, job_type: MetricsJobType) -> ReplicationMetrics {
        ReplicationMetrics::launched(&CopyJobId::new(job_id), job_type)
    }

    #[test]
    fn test_metrics_from_empty_counters() {
        let report = CopyJobReport {
            job_id: CopyJobId::new("job_1"),
            state: RunState::Prep,
            counters: CopyCounters::new(),
            started_at: Utc::now(),
            finished_at: None,
        };
        let m = ReplicationMetrics::from_report(&report, MetricsJobType::Main);
        assert_eq!(m.total_tasks, 0);
        assert_eq!(m.completed_tasks, 0);
        assert_eq!(m.failed_tasks, 0);
        assert_eq!(m.killed_tasks, 0);
    }

    #[test]
    fn test_tracking_info_slots() {
        let mut info = TrackingInfo::new();
        assert!(info.current().is_none());

        info.record(metrics("job_main", MetricsJobType::Main)).unwrap();
        assert_eq!(info.current().unwrap().job_id, "job_main");

        let mut updated = metrics("job_main", MetricsJobType::Main);
        updated.completed_tasks = 5;
        info.record(updated).unwrap();
        assert_eq!(info.entries().len(), 1);
        assert_eq!(info.current().unwrap().completed_tasks, 5);

        info.record(metrics("job_rec", MetricsJobType::Recovery)).unwrap();
        assert!(info.has_recovery());
        assert_eq!(info.current().unwrap().job_id, "job_rec");

        assert!(matches!(
            info.record(metrics("job_rec_2", MetricsJobType::Recovery)),
            Err(SchedError::RecoveryLimit(_))
        ));
        assert!(matches!(
            info.record(metrics("job_main_2", MetricsJobType::Main)),
            Err(SchedError::InconsistentState(_))
        ));

        let json = info.to_json().unwrap();
        assert_eq!(TrackingInfo::from_json(&json).unwrap(), info);
    }

    #[test]
    fn test_recovery_without_main_rejected() {
        let mut info = TrackingInfo::new();
        assert!(matches!(
            info.record(metrics("job_rec", MetricsJobType::Recovery)),
            Err(SchedError::InconsistentState(_))
        ));
    }

    #[tokio::test]
    async fn test_collector_persists_metrics() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let chain = build_chain(&[ReplicationJobDetail::new(
            "t",
            "p1",
            ReplicationType::Test,
            None,
        )])
        .unwrap();
        let instance = store.create_instance("p1", &chain, Utc::now()).await.unwrap();

        let sim = Arc::new(SimulatedEngine::new().with_maps(8));
        sim.script([SimOutcome::Hang]);
        let job_id = sim
            .submit(&CopyOptions::new("hdfs://src/a", "hdfs://tgt/a"))
            .await
            .unwrap();
        let engine: Arc<dyn CopyEngine> = sim.clone();

        let collector = MetricsCollector::start(
            store.clone(),
            engine,
            instance.id.clone(),
            job_id.clone(),
            MetricsJobType::Main,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        collector.stop().await;

        let info = store.load_tracking_info(&instance.id).await.unwrap();
        let current = info.current().unwrap();
        assert_eq!(current.job_id, job_id.to_string());
        assert_eq!(current.total_tasks, 8);
    }

    #[tokio::test]
    async fn test_stopped_collector_writes_nothing() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let chain = build_chain(&[ReplicationJobDetail::new(
            "t",
            "p1",
            ReplicationType::Test,
            None,
        )])
        .unwrap();
        let instance = store.create_instance("p1", &chain, Utc::now()).await.unwrap();
        let run_count = store
            .increment_run_count(&instance.id, 0, 0, Utc::now())
            .await
            .unwrap();

        let sim = Arc::new(SimulatedEngine::new().with_maps(4));
        sim.script([SimOutcome::Hang]);
        let job_id = sim
            .submit(&CopyOptions::new("hdfs://src/a", "hdfs://tgt/a"))
            .await
            .unwrap();
        let engine: Arc<dyn CopyEngine> = sim.clone();

        let collector = MetricsCollector::start(
            store.clone(),
            engine,
            instance.id.clone(),
            job_id,
            MetricsJobType::Main,
            Duration::from_millis(5),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        collector.stop().await;

        // The next job starts with empty tracking info and keeps it
        store
            .record_start(&instance.id, 0, run_count, Utc::now())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let info = store.load_tracking_info(&instance.id).await.unwrap();
        assert!(info.entries().is_empty());
    }
}
