//! Cluster filesystem contract.
//!
//! Replication strategies need a small set of filesystem operations on both
//! clusters: existence checks, snapshot management and snapshot diffs.
//! Handles are opened per job through an [`FsRegistry`] and closed in the
//! job's cleanup.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Snapshot name standing for the live state of a directory in a diff.
pub const CURRENT_STATE: &str = ".";

/// A snapshot of a snapshottable directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Kind of change in a snapshot diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffKind {
    Create,
    Modify,
    Delete,
    Rename,
}

/// One entry of a snapshot diff report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub kind: DiffKind,
    /// Path relative to the snapshot root.
    pub path: String,
}

impl DiffEntry {
    pub fn new(kind: DiffKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Handle to a cluster filesystem.
///
/// All paths are fully-qualified URIs.
#[async_trait]
pub trait ClusterFs: Send + Sync {
    /// Root URI (`scheme://authority`) this handle serves.
    fn uri(&self) -> &str;

    /// Check whether a path exists.
    async fn exists(&self, path: &str) -> EngineResult<bool>;

    /// Check whether snapshots are enabled on a directory.
    async fn is_snapshottable(&self, path: &str) -> EngineResult<bool>;

    /// Create a named snapshot of a directory.
    async fn create_snapshot(&self, path: &str, name: &str) -> EngineResult<()>;

    /// List the snapshots of a directory, oldest first.
    async fn list_snapshots(&self, path: &str) -> EngineResult<Vec<SnapshotInfo>>;

    /// Delete a named snapshot.
    async fn delete_snapshot(&self, path: &str, name: &str) -> EngineResult<()>;

    /// Diff a directory between two snapshots; `to` may be [`CURRENT_STATE`].
    async fn snapshot_diff(&self, path: &str, from: &str, to: &str)
    -> EngineResult<Vec<DiffEntry>>;

    /// Release the handle.
    async fn close(&self) -> EngineResult<()>;
}

/// Extract the URI scheme, if the path has one.
fn scheme(path: &str) -> Option<&str> {
    let (scheme, _) = path.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Check whether a path lives on a Hadoop-compatible filesystem other than
/// HDFS (object stores such as `s3n://` or `wasb://`).
///
/// Paths without a scheme resolve to the default filesystem and are not
/// HCFS.
pub fn is_hcfs(path: &str) -> EngineResult<bool> {
    let path = path.trim();
    if path.is_empty() {
        return Err(EngineError::InvalidPath("filePath cannot be empty".into()));
    }
    Ok(match scheme(path) {
        None => false,
        Some(s) => !s.eq_ignore_ascii_case("hdfs"),
    })
}

/// Build the staging URI of a dataset on a cluster.
///
/// A dataset that already carries a scheme is used as is; otherwise it is
/// resolved against the cluster's namenode endpoint when one is known.
pub fn staging_uri(namenode: Option<&str>, dataset: &str) -> EngineResult<String> {
    let dataset = dataset.trim();
    if dataset.is_empty() {
        return Err(EngineError::InvalidPath("dataset path cannot be empty".into()));
    }
    if scheme(dataset).is_some() {
        return Ok(dataset.to_string());
    }
    match namenode.map(str::trim).filter(|nn| !nn.is_empty()) {
        Some(nn) => Ok(format!(
            "{}/{}",
            nn.trim_end_matches('/'),
            dataset.trim_start_matches('/')
        )),
        None => Ok(dataset.to_string()),
    }
}

/// Filesystem root (`scheme://authority`) of a URI; empty for scheme-less
/// paths.
pub fn filesystem_root(uri: &str) -> &str {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return "";
    };
    let authority_len = rest.find('/').unwrap_or(rest.len());
    &uri[..scheme.len() + 3 + authority_len]
}

/// Factory opening a filesystem handle for a URI.
pub type FsFactory = Box<dyn Fn(&str) -> EngineResult<Arc<dyn ClusterFs>> + Send + Sync>;

/// Registry of filesystem factories keyed by filesystem root.
#[derive(Default)]
pub struct FsRegistry {
    factories: FxHashMap<String, FsFactory>,
}

impl FsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a filesystem root such as `hdfs://nn:8020`.
    pub fn register<F>(&mut self, root: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> EngineResult<Arc<dyn ClusterFs>> + Send + Sync + 'static,
    {
        self.factories.insert(root.into(), Box::new(factory));
    }

    /// Open a handle for the filesystem serving `uri`.
    pub fn open(&self, uri: &str) -> EngineResult<Arc<dyn ClusterFs>> {
        let root = filesystem_root(uri);
        let factory = self
            .factories
            .get(root)
            .ok_or_else(|| EngineError::FilesystemUnavailable(uri.to_string()))?;
        factory(uri)
    }

    /// Registered filesystem roots.
    pub fn roots(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_hcfs() {
        assert!(matches!(is_hcfs(""), Err(EngineError::InvalidPath(_))));
        assert!(matches!(is_hcfs("   "), Err(EngineError::InvalidPath(_))));
        assert!(!is_hcfs("/apps/dr/warehouse").unwrap());
        assert!(!is_hcfs("hdfs://nn:8020/apps/dr").unwrap());
        assert!(!is_hcfs("HDFS://nn:8020/apps/dr").unwrap());
        assert!(is_hcfs("s3n://bucket/apps/dr").unwrap());
        assert!(is_hcfs("wasb://container@account/apps").unwrap());
    }

    #[test]
    fn test_staging_uri() {
        assert_eq!(
            staging_uri(Some("hdfs://nn:8020/"), "/apps/dr").unwrap(),
            "hdfs://nn:8020/apps/dr"
        );
        assert_eq!(
            staging_uri(Some("hdfs://nn:8020"), "s3n://bucket/dr").unwrap(),
            "s3n://bucket/dr"
        );
        assert_eq!(staging_uri(None, "/apps/dr").unwrap(), "/apps/dr");
        assert!(staging_uri(Some("hdfs://nn:8020"), "").is_err());
    }

    #[test]
    fn test_filesystem_root() {
        assert_eq!(filesystem_root("hdfs://nn:8020/apps/dr"), "hdfs://nn:8020");
        assert_eq!(filesystem_root("hdfs://nn:8020"), "hdfs://nn:8020");
        assert_eq!(filesystem_root("/apps/dr"), "");
    }

    #[test]
    fn test_registry_unknown_root() {
        let registry = FsRegistry::new();
        assert!(matches!(
            registry.open("hdfs://nowhere:8020/apps"),
            Err(EngineError::FilesystemUnavailable(_))
        ));
    }
}
