//! Cluster pairing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};
use crate::persistence::StateStore;

/// Status of a cluster pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PairStatus {
    Paired,
    Unpaired,
    Suspended,
}

impl PairStatus {
    pub fn name(&self) -> &'static str {
        match self {
            PairStatus::Paired => "PAIRED",
            PairStatus::Unpaired => "UNPAIRED",
            PairStatus::Suspended => "SUSPENDED",
        }
    }
}

impl std::fmt::Display for PairStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for PairStatus {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PAIRED" => Ok(PairStatus::Paired),
            "UNPAIRED" => Ok(PairStatus::Unpaired),
            "SUSPENDED" => Ok(PairStatus::Suspended),
            other => Err(SchedError::ConfigError(format!(
                "unknown pair status '{other}'"
            ))),
        }
    }
}

/// A pairing between two cluster versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterPair {
    pub cluster_name: String,
    pub cluster_version: i64,
    pub paired_cluster_name: String,
    pub paired_cluster_version: i64,
    pub status: PairStatus,
    pub last_modified: DateTime<Utc>,
}

impl ClusterPair {
    pub fn new(
        cluster_name: impl Into<String>,
        cluster_version: i64,
        paired_cluster_name: impl Into<String>,
        paired_cluster_version: i64,
        status: PairStatus,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            cluster_version,
            paired_cluster_name: paired_cluster_name.into(),
            paired_cluster_version,
            status,
            last_modified: Utc::now(),
        }
    }

    /// Check whether `name`/`version` appears on either side of the pair.
    pub fn involves(&self, name: &str, version: i64) -> bool {
        (self.cluster_name == name && self.cluster_version == version)
            || (self.paired_cluster_name == name && self.paired_cluster_version == version)
    }

    /// The side of the pair that is not `name`.
    pub fn peer_of(&self, name: &str) -> (&str, i64) {
        if self.cluster_name == name {
            (&self.paired_cluster_name, self.paired_cluster_version)
        } else {
            (&self.cluster_name, self.cluster_version)
        }
    }

    /// Validate the pair before it is written.
    pub fn validate(&self) -> SchedResult<()> {
        if self.cluster_name.trim().is_empty() || self.paired_cluster_name.trim().is_empty() {
            return Err(SchedError::ConfigError(
                "cluster names cannot be empty".into(),
            ));
        }
        if self.cluster_name == self.paired_cluster_name
            && self.cluster_version == self.paired_cluster_version
        {
            return Err(SchedError::ConfigError(format!(
                "cluster {} cannot be paired with itself",
                self.cluster_name
            )));
        }
        Ok(())
    }
}

/// Validate and write a pairing.
pub async fn pair_clusters(store: &dyn StateStore, pair: &ClusterPair) -> SchedResult<()> {
    pair.validate()?;
    store.pair_clusters(pair).await?;
    tracing::info!(
        cluster = %pair.cluster_name,
        peer = %pair.paired_cluster_name,
        status = %pair.status,
        "Cluster pair updated"
    );
    Ok(())
}
