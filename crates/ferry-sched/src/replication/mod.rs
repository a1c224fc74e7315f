//! Replication strategies.
//!
//! | Type | Strategy | External work |
//! |------|----------|---------------|
//! | `HDFS` | [`FsReplication`] | copy job, snapshots when configured |
//! | `HDFSSNAPSHOT` | [`FsReplication`] (snapshot mode required) | copy job, snapshots |
//! | `HIVE` | [`HiveReplication`] | copy job of the warehouse directory |
//! | `TEST` | [`TestReplication`] | none |

mod copy;
mod fs;
mod hive;
mod testing;

pub use fs::{snapshot_name, snapshots_to_evict, FsReplication, SNAPSHOT_PREFIX};
pub use hive::{HiveReplication, WAREHOUSE_ROOT};
pub use testing::TestReplication;

use ferry_engine::{staging_uri, CopyOptions};

use crate::error::SchedResult;
use crate::job::ReplicationJobDetail;

/// Job property keys.
pub mod props {
    pub const SOURCE_DATASET: &str = "sourceDataset";
    pub const TARGET_DATASET: &str = "targetDataset";
    pub const SOURCE_NN: &str = "sourceNN";
    pub const TARGET_NN: &str = "targetNN";
    pub const QUEUE_NAME: &str = "queueName";
    pub const DISTCP_MAX_MAPS: &str = "distcpMaxMaps";
    pub const DISTCP_MAP_BANDWIDTH: &str = "distcpMapBandwidth";
    pub const TDE_ENCRYPTION_ENABLED: &str = "tde.encryption.enabled";
    pub const SOURCE_SNAPSHOT_AGE_LIMIT: &str = "source.snapshot.retention.age.limit";
    pub const SOURCE_SNAPSHOT_NUMBER: &str = "source.snapshot.retention.number";
    pub const TARGET_SNAPSHOT_AGE_LIMIT: &str = "target.snapshot.retention.age.limit";
    pub const TARGET_SNAPSHOT_NUMBER: &str = "target.snapshot.retention.number";
    pub const SOURCE_DATABASE: &str = "sourceDatabase";
    pub const SLEEP_MILLIS: &str = "sleepMillis";
    pub const FAIL_WITH: &str = "failWith";
}

/// Staging URIs of a job's source and target datasets.
pub(crate) fn endpoints(
    detail: &ReplicationJobDetail,
    source_dataset: &str,
    target_dataset: &str,
) -> SchedResult<(String, String)> {
    let source = staging_uri(detail.property(props::SOURCE_NN), source_dataset)?;
    let target = staging_uri(detail.property(props::TARGET_NN), target_dataset)?;
    Ok((source, target))
}

/// Copy options carrying the job's engine tuning properties.
pub(crate) fn copy_options(
    detail: &ReplicationJobDetail,
    source: &str,
    target: &str,
) -> SchedResult<CopyOptions> {
    let mut options = CopyOptions::new(source, target);
    if let Some(queue) = detail
        .property(props::QUEUE_NAME)
        .filter(|q| !q.trim().is_empty())
    {
        options = options.with_queue(queue.trim());
    }
    if let Some(maps) = detail.parsed::<u32>(props::DISTCP_MAX_MAPS)? {
        options = options.with_max_maps(maps);
    }
    if let Some(bandwidth) = detail.parsed::<u32>(props::DISTCP_MAP_BANDWIDTH)? {
        options = options.with_bandwidth(bandwidth);
    }
    Ok(options)
}
