//! Persistence layer for policies, instances and cluster pairs.
//!
//! The store is the single source of truth for what happened to an
//! instance. Every write is one transaction; writes that carry a run count
//! are rejected when the stored run count moved on.

mod sqlite_store;

pub use sqlite_store::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cluster::ClusterPair;
use crate::error::SchedResult;
use crate::instance::{InstanceFilter, InstanceId, InstanceJob, PolicyInstance};
use crate::job::{JobStatus, ReplicationJobDetail};
use crate::metrics::{ReplicationMetrics, TrackingInfo};
use crate::policy::ReplicationPolicy;

/// Trait for persistent state storage.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Save or replace a policy.
    async fn save_policy(&self, policy: &ReplicationPolicy) -> SchedResult<()>;

    /// Load a policy by name.
    async fn load_policy(&self, name: &str) -> SchedResult<Option<ReplicationPolicy>>;

    /// List all policies.
    async fn list_policies(&self) -> SchedResult<Vec<ReplicationPolicy>>;

    /// Materialize a new instance of a policy with one `NOT_STARTED` row per
    /// chain position.
    async fn create_instance(
        &self,
        policy_name: &str,
        chain: &[ReplicationJobDetail],
        created_at: DateTime<Utc>,
    ) -> SchedResult<PolicyInstance>;

    /// Load an instance.
    async fn load_instance(&self, instance_id: &InstanceId)
    -> SchedResult<Option<PolicyInstance>>;

    /// List instances matching a filter, newest first.
    async fn list_instances(&self, filter: &InstanceFilter) -> SchedResult<Vec<PolicyInstance>>;

    /// Get one instance-job row.
    ///
    /// A missing row is [`SchedError::InstanceJobNotFound`]; a row that was
    /// never started is returned with status `NOT_STARTED`.
    ///
    /// [`SchedError::InstanceJobNotFound`]: crate::error::SchedError::InstanceJobNotFound
    async fn get_instance_job(
        &self,
        instance_id: &InstanceId,
        offset: usize,
    ) -> SchedResult<InstanceJob>;

    /// All instance-job rows of an instance in offset order.
    async fn instance_jobs(&self, instance_id: &InstanceId) -> SchedResult<Vec<InstanceJob>>;

    /// Open a new attempt resuming at `offset`.
    ///
    /// Succeeds only if the instance's run count still equals
    /// `expected_run_count`. Resets every non-successful row from `offset`
    /// on, clears the tracking info and returns the new run count.
    async fn increment_run_count(
        &self,
        instance_id: &InstanceId,
        offset: usize,
        expected_run_count: u32,
        now: DateTime<Utc>,
    ) -> SchedResult<u32>;

    /// Move a job to `RUNNING`. Repeating an identical call is a no-op.
    ///
    /// Clears the instance's tracking info, which always describes the job
    /// currently running.
    async fn record_start(
        &self,
        instance_id: &InstanceId,
        offset: usize,
        run_count: u32,
        start_time: DateTime<Utc>,
    ) -> SchedResult<()>;

    /// Write a job's terminal state. Only legal from `RUNNING`.
    #[allow(clippy::too_many_arguments)]
    async fn record_completion(
        &self,
        instance_id: &InstanceId,
        offset: usize,
        run_count: u32,
        status: JobStatus,
        message: &str,
        end_time: DateTime<Utc>,
        context_data: Option<&str>,
    ) -> SchedResult<()>;

    /// Persist the recovery context of a running job.
    async fn save_job_context(
        &self,
        instance_id: &InstanceId,
        offset: usize,
        run_count: u32,
        context_data: &str,
    ) -> SchedResult<()>;

    /// Write the outcome of an attempt on the instance row.
    async fn finish_attempt(
        &self,
        instance_id: &InstanceId,
        run_count: u32,
        status: JobStatus,
        message: &str,
        end_time: DateTime<Utc>,
        terminal: bool,
    ) -> SchedResult<()>;

    /// Mark an instance that never launched an attempt, or is waiting for
    /// one, as finished.
    async fn close_instance(
        &self,
        instance_id: &InstanceId,
        status: JobStatus,
        message: &str,
        end_time: DateTime<Utc>,
    ) -> SchedResult<()>;

    /// Force a non-terminal instance to a terminal state, whatever attempt
    /// it is in.
    ///
    /// Jobs still `RUNNING` get the same status and message. Only legal once
    /// no driver owns the instance. Returns `false` if it was already
    /// terminal.
    async fn abort_instance(
        &self,
        instance_id: &InstanceId,
        status: JobStatus,
        message: &str,
        end_time: DateTime<Utc>,
    ) -> SchedResult<bool>;

    /// Insert or update the metrics entry of a copy job.
    async fn record_metrics(
        &self,
        instance_id: &InstanceId,
        metrics: &ReplicationMetrics,
    ) -> SchedResult<()>;

    /// Load the tracking info of an instance.
    async fn load_tracking_info(&self, instance_id: &InstanceId) -> SchedResult<TrackingInfo>;

    /// Retire a terminal instance and its rows. Returns `false` if it was
    /// already retired.
    async fn mark_retired(
        &self,
        instance_id: &InstanceId,
        retirement_time: DateTime<Utc>,
    ) -> SchedResult<bool>;

    /// Retire terminal instances that ended before `cutoff`.
    async fn retire_completed_before(
        &self,
        cutoff: DateTime<Utc>,
        retirement_time: DateTime<Utc>,
    ) -> SchedResult<usize>;

    /// Delete instances retired before `cutoff`.
    async fn purge_retired_before(&self, cutoff: DateTime<Utc>) -> SchedResult<usize>;

    /// Insert a cluster pair or update the status of the existing one.
    async fn pair_clusters(&self, pair: &ClusterPair) -> SchedResult<()>;

    /// Pairs in which the cluster appears on either side.
    async fn paired_clusters(&self, name: &str, version: i64) -> SchedResult<Vec<ClusterPair>>;
}
