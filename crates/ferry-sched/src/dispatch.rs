//! Replication type to strategy dispatch.

use crate::execution::{JobEnvironment, ReplicationJob, SentinelNode};
use crate::job::{ReplicationJobDetail, ReplicationType};
use crate::replication::{FsReplication, HiveReplication, TestReplication};

/// Build the strategy executing a job descriptor.
///
/// Unknown type tags never reach this point: they are rejected when the
/// descriptor is parsed. Construction touches neither the engine nor the
/// store.
pub fn dispatch(detail: ReplicationJobDetail, env: &JobEnvironment) -> Box<dyn ReplicationJob> {
    match detail.job_type() {
        ReplicationType::Start | ReplicationType::End => Box::new(SentinelNode::new(detail)),
        ReplicationType::Hdfs => Box::new(FsReplication::new(detail, env.clone(), false)),
        ReplicationType::HdfsSnapshot => Box::new(FsReplication::new(detail, env.clone(), true)),
        ReplicationType::Hive => Box::new(HiveReplication::new(detail, env.clone())),
        ReplicationType::Test => Box::new(TestReplication::new(detail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ferry_engine::sim::SimulatedEngine;
    use ferry_engine::FsRegistry;

    use crate::chain::{build_chain, END_NODE, START_NODE};
    use crate::error::SchedError;
    use crate::persistence::SqliteStore;

    fn env() -> JobEnvironment {
        JobEnvironment::new(
            Arc::new(SimulatedEngine::new()),
            Arc::new(FsRegistry::new()),
            Arc::new(SqliteStore::in_memory().unwrap()),
        )
    }

    #[test]
    fn test_dispatch_keeps_descriptor() {
        let env = env();
        let chain = build_chain(&[
            ReplicationJobDetail::new("a", "p1", ReplicationType::Hdfs, None),
            ReplicationJobDetail::new("b", "p1", ReplicationType::HdfsSnapshot, None),
            ReplicationJobDetail::new("c", "p1", ReplicationType::Hive, None),
            ReplicationJobDetail::new("d", "p1", ReplicationType::Test, None),
        ])
        .unwrap();

        let ids: Vec<String> = chain
            .iter()
            .map(|d| dispatch(d.clone(), &env).detail().identifier().to_string())
            .collect();
        assert_eq!(ids, vec![START_NODE, "a", "b", "c", "d", END_NODE]);
    }

    #[test]
    fn test_unknown_type_fails_fast() {
        let err = ReplicationJobDetail::parse("x", "p1", "FTP", None).unwrap_err();
        assert!(matches!(err, SchedError::UnknownReplicationType(t) if t == "FTP"));
    }
}
