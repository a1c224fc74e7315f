//! Node chain construction.
//!
//! Every policy executes as a chain bracketed by two sentinels:
//!
//! ```text
//!   START-NODE ──→ job 1 ──→ job 2 ──→ … ──→ job N ──→ END-NODE
//! ```
//!
//! Sentinels are no-ops in every lifecycle phase but get instance-job rows,
//! so each instance has a well-defined first and last offset.

use crate::error::{SchedError, SchedResult};
use crate::job::{ReplicationJobDetail, ReplicationType};

/// Identifier of the leading sentinel.
pub const START_NODE: &str = "START-NODE";

/// Identifier of the trailing sentinel.
pub const END_NODE: &str = "END-NODE";

fn sentinel(policy_name: &str, identifier: &str, job_type: ReplicationType) -> ReplicationJobDetail {
    ReplicationJobDetail::new(identifier, policy_name, job_type, None)
}

/// Bracket a policy's job descriptors with the START and END sentinels.
///
/// The policy name is taken from the first descriptor.
pub fn build_chain(details: &[ReplicationJobDetail]) -> SchedResult<Vec<ReplicationJobDetail>> {
    let first = details.first().ok_or(SchedError::EmptyChain)?;
    let policy_name = first.policy_name();

    let mut chain = Vec::with_capacity(details.len() + 2);
    chain.push(sentinel(policy_name, START_NODE, ReplicationType::Start));
    chain.extend_from_slice(details);
    chain.push(sentinel(policy_name, END_NODE, ReplicationType::End));
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn detail(id: &str) -> ReplicationJobDetail {
        ReplicationJobDetail::new(id, "p1", ReplicationType::Test, None)
    }

    #[test]
    fn test_build_chain() {
        let chain = build_chain(&[detail("a"), detail("b")]).unwrap();
        let ids: Vec<_> = chain.iter().map(|d| d.identifier()).collect();
        assert_eq!(ids, vec![START_NODE, "a", "b", END_NODE]);

        assert_eq!(chain[0].job_type(), ReplicationType::Start);
        assert_eq!(chain[3].job_type(), ReplicationType::End);
        assert_eq!(chain[0].policy_name(), "p1");
        assert!(chain[0].properties().is_none());
        assert!(chain[3].properties().is_none());
    }

    #[test]
    fn test_build_chain_empty() {
        assert!(matches!(build_chain(&[]), Err(SchedError::EmptyChain)));
    }

    proptest! {
        #[test]
        fn chain_has_sentinels(ids in proptest::collection::vec("[a-z]{1,8}", 1..20)) {
            let details: Vec<_> = ids.iter().map(|id| detail(id)).collect();
            let chain = build_chain(&details).unwrap();

            prop_assert_eq!(chain.len(), details.len() + 2);
            prop_assert_eq!(chain[0].identifier(), START_NODE);
            prop_assert_eq!(chain[details.len() + 1].identifier(), END_NODE);
            prop_assert_eq!(&chain[1..=details.len()], details.as_slice());
        }
    }
}
