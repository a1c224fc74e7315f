//! Ferry Replication Scheduler
//!
//! This crate runs replication policies: named chains of copy jobs that
//! move a dataset from one cluster to another. Every run of a policy is a
//! persisted *instance*; the scheduler drives it job by job, retries it
//! within the policy's budget and resumes it after a crash.
//!
//! # Overview
//!
//! - [`ReplicationPolicy`] loaded from YAML, turned into a job chain
//!   bracketed by sentinel nodes ([`chain`])
//! - [`ReplicationScheduler`] implementing [`PolicyScheduler`]: submit,
//!   status and cancel, plus timer triggers per policy
//! - Per-type executors ([`replication`]) for filesystem (optionally
//!   snapshot based), Hive and test jobs, selected by [`dispatch`]
//! - [`RetryController`] enforcing attempt limits and backoff
//! - [`RecoveryCoordinator`] reattaching to copy jobs that outlived the
//!   process that launched them
//! - A [`StateStore`] trait with a SQLite implementation
//! - Services ([`service`]) for housekeeping, recovery and triggers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ReplicationScheduler                      │
//! │   ┌───────────────┐  ┌──────────────┐  ┌─────────────────┐  │
//! │   │RetryController│  │ ChainRunner  │  │    Triggers     │  │
//! │   └───────┬───────┘  └──────┬───────┘  └─────────────────┘  │
//! └───────────┼─────────────────┼───────────────────────────────┘
//!             │                 │ dispatch
//!             │        ┌────────┴─────────┬───────────────┐
//!             │        ▼                  ▼               ▼
//!             │  ┌───────────┐     ┌─────────────┐  ┌───────────┐
//!             │  │    FS     │     │    Hive     │  │   Test    │
//!             │  └─────┬─────┘     └──────┬──────┘  └───────────┘
//!             │        └───────┬──────────┘
//!             │                ▼
//!             │      CopyEngine / ClusterFs (ferry-engine)
//!             ▼
//!      ┌────────────┐
//!      │ StateStore │  policies, instances, instance jobs, metrics
//!      └────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ferry_engine::{FsRegistry, sim::SimulatedEngine};
//! use ferry_sched::{JobEnvironment, PolicyScheduler, ReplicationPolicy, ReplicationScheduler, SqliteStore};
//!
//! let env = JobEnvironment::new(
//!     Arc::new(SimulatedEngine::new()),
//!     Arc::new(FsRegistry::new()),
//!     Arc::new(SqliteStore::new("ferry.db")?),
//! );
//! let scheduler = ReplicationScheduler::new(env);
//!
//! scheduler.register_policy(&ReplicationPolicy::from_file("policy.yaml")?).await?;
//! let instance = scheduler.submit_and_track("nightly-dr").await?;
//! let finished = scheduler.wait(&instance).await?;
//! println!("{} finished: {}", instance, finished.status);
//! ```

pub mod chain;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod execution;
pub mod housekeeping;
pub mod instance;
pub mod job;
pub mod metrics;
pub mod persistence;
pub mod policy;
pub mod recovery;
pub mod replication;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod service;

pub use chain::{build_chain, END_NODE, START_NODE};
pub use clock::Clock;
pub use cluster::{pair_clusters, ClusterPair, PairStatus};
pub use config::{ExecutionConfig, HousekeepingConfig, SchedulerConfig, StoreConfig};
pub use dispatch::dispatch;
pub use error::{ErrorKind, SchedError, SchedResult};
pub use execution::{JobEnvironment, RecoveryOutcome, ReplicationJob};
pub use housekeeping::{HousekeepingPool, HousekeepingTask, PurgeRetired, RetireCompleted};
pub use instance::{InstanceFilter, InstanceId, InstanceJob, PolicyInstance};
pub use job::{Completion, JobContext, JobStatus, ReplicationJobDetail, ReplicationType};
pub use metrics::{MetricsJobType, ReplicationMetrics, TrackingInfo};
pub use persistence::{SqliteStore, StateStore};
pub use policy::{PolicyJob, ReplicationPolicy, RetryPolicy};
pub use recovery::RecoveryCoordinator;
pub use retry::{RetryController, RetryDecision};
pub use runner::{AttemptOutcome, ChainRunner};
pub use scheduler::{PolicyScheduler, ReplicationScheduler};
pub use service::{Service, ServiceContext, ServiceDeps, ServiceManager, ServiceRegistry};
