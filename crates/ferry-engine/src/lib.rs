//! Ferry Copy Engine Layer
//!
//! This crate defines the contracts the Ferry scheduler uses to move data
//! between clusters, so the scheduler core never talks to a concrete bulk
//! copy engine or filesystem client directly.
//!
//! # Overview
//!
//! - A [`CopyEngine`] trait for submitting, observing and killing copy jobs
//! - [`CopyJobReport`] and [`CopyCounters`] describing a job's progress
//! - A [`ClusterFs`] trait covering existence checks, snapshots and
//!   snapshot diffs, with handles opened through an [`FsRegistry`]
//! - An in-process [`sim`] module with a scripted engine and an in-memory
//!   filesystem
//!
//! # Example: Running a Copy
//!
//! ```ignore
//! use std::time::Duration;
//! use ferry_engine::{CopyEngine, CopyOptions, sim::SimulatedEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = SimulatedEngine::new();
//!
//!     let options = CopyOptions::new("hdfs://src:8020/apps/dr", "hdfs://tgt:8020/apps/dr")
//!         .with_max_maps(20);
//!     let job_id = engine.submit(&options).await?;
//!
//!     let report = engine.wait(&job_id, Duration::from_millis(500)).await?;
//!     println!("{} finished: {}", job_id, report.state);
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod fs;
pub mod job;
pub mod options;
pub mod sim;

pub use engine::CopyEngine;
pub use error::{EngineError, EngineResult};
pub use fs::{
    filesystem_root, is_hcfs, staging_uri, ClusterFs, DiffEntry, DiffKind, FsFactory, FsRegistry,
    SnapshotInfo, CURRENT_STATE,
};
pub use job::{
    CopyCounters, CopyJobId, CopyJobReport, RunState, BYTES_COPIED, COPY_COUNTER_GROUP,
    JOB_COUNTER_GROUP, NUM_COMPLETED_MAPS, NUM_FAILED_MAPS, NUM_KILLED_MAPS, TOTAL_LAUNCHED_MAPS,
};
pub use options::CopyOptions;
