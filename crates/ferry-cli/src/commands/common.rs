//! Shared helpers for CLI commands.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::{style, StyledObject};

use ferry_engine::sim::{MemoryFs, SimulatedEngine};
use ferry_engine::{filesystem_root, staging_uri, FsRegistry};
use ferry_sched::config::STATE_DB_FILE;
use ferry_sched::replication::{props, WAREHOUSE_ROOT};
use ferry_sched::{
    InstanceJob, JobEnvironment, JobStatus, ReplicationPolicy, ReplicationScheduler,
    ReplicationType, SchedulerConfig, SqliteStore, StateStore,
};

/// How long a simulated copy job runs.
const SIMULATED_RUN_TIME: Duration = Duration::from_secs(2);

/// Return the default Ferry state directory (~/.ferry/).
pub fn default_state_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".ferry"))
}

/// Load the configuration and pin the state database to a file.
///
/// Without a configured store path the database lives in the default state
/// directory.
pub fn load_config(path: Option<&Path>) -> Result<SchedulerConfig> {
    let mut config = SchedulerConfig::load(path)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;

    let db_path = match config.store.path.clone() {
        Some(path) => path,
        None => default_state_dir()?.join(STATE_DB_FILE),
    };
    if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
    }
    config.store.path = Some(db_path);
    Ok(config)
}

/// Open the state database named by the configuration.
pub fn open_store(config: &SchedulerConfig) -> Result<Arc<dyn StateStore>> {
    let store = match &config.store.path {
        Some(path) => SqliteStore::new(path).map_err(|e| {
            anyhow::anyhow!("Failed to open state store at {}: {}", path.display(), e)
        })?,
        None => SqliteStore::in_memory()
            .map_err(|e| anyhow::anyhow!("Failed to open in-memory state store: {e}"))?,
    };
    Ok(Arc::new(store))
}

/// Staging URIs of the datasets a policy touches.
pub fn dataset_uris(policy: &ReplicationPolicy) -> Vec<String> {
    let mut uris = Vec::new();
    for job in &policy.jobs {
        let prop = |key: &str| {
            job.properties
                .get(key)
                .map(String::as_str)
                .filter(|v| !v.trim().is_empty())
        };
        let source_dataset = match (prop(props::SOURCE_DATASET), prop(props::SOURCE_DATABASE)) {
            (Some(dataset), _) => dataset.to_string(),
            (None, Some(db)) if job.job_type.eq_ignore_ascii_case(ReplicationType::Hive.name()) => {
                format!("{WAREHOUSE_ROOT}/{}.db", db.trim())
            }
            _ => continue,
        };
        let target_dataset = prop(props::TARGET_DATASET)
            .map(str::to_string)
            .unwrap_or_else(|| source_dataset.clone());

        for (nn, dataset) in [
            (prop(props::SOURCE_NN), &source_dataset),
            (prop(props::TARGET_NN), &target_dataset),
        ] {
            if let Ok(uri) = staging_uri(nn, dataset) {
                uris.push(uri);
            }
        }
    }
    uris
}

/// In-memory filesystems serving every dataset of the given policies.
///
/// Each dataset directory exists and is snapshottable, so snapshot-based
/// replication runs end to end against the simulation.
pub fn simulated_filesystems<'a>(
    policies: impl IntoIterator<Item = &'a ReplicationPolicy>,
) -> BTreeMap<String, Arc<MemoryFs>> {
    let mut filesystems: BTreeMap<String, Arc<MemoryFs>> = BTreeMap::new();
    for policy in policies {
        for uri in dataset_uris(policy) {
            let root = filesystem_root(&uri);
            if root.is_empty() {
                continue;
            }
            filesystems
                .entry(root.to_string())
                .or_insert_with(|| MemoryFs::new(root))
                .add_dir(&uri, true);
        }
    }
    filesystems
}

/// Create a scheduler over the local state store and the simulated engine.
///
/// Filesystems are derived from the stored policies plus `extra`.
pub async fn create_scheduler(
    config: &SchedulerConfig,
    extra: Option<&ReplicationPolicy>,
) -> Result<ReplicationScheduler> {
    let store = open_store(config)?;
    let mut policies = store
        .list_policies()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list policies: {e}"))?;
    if let Some(policy) = extra {
        policies.retain(|p| p.name != policy.name);
        policies.push(policy.clone());
    }

    let engine = SimulatedEngine::new().with_run_time(SIMULATED_RUN_TIME);
    let mut registry = FsRegistry::new();
    for fs in simulated_filesystems(&policies).into_values() {
        engine.attach_filesystem(fs.clone());
        fs.register(&mut registry);
    }

    let env = JobEnvironment::new(Arc::new(engine), Arc::new(registry), store)
        .with_settings(config.execution.clone());
    Ok(ReplicationScheduler::new(env))
}

/// Status text styled by outcome.
pub fn styled_status(status: JobStatus) -> StyledObject<&'static str> {
    let name = status.name();
    match status {
        JobStatus::Success => style(name).green(),
        JobStatus::Failed | JobStatus::Killed => style(name).red(),
        JobStatus::Running => style(name).cyan(),
        JobStatus::NotStarted => style(name).yellow(),
    }
}

/// Print the chain view of an instance.
pub fn print_jobs(jobs: &[InstanceJob]) {
    println!(
        "  {:<6}  {:<24}  {:<13}  {:<12}  {:<5}  {}",
        style("OFFSET").bold(),
        style("JOB").bold(),
        style("TYPE").bold(),
        style("STATUS").bold(),
        style("RUNS").bold(),
        style("MESSAGE").bold()
    );
    println!("  {}", "-".repeat(90));
    for job in jobs {
        println!(
            "  {:<6}  {:<24}  {:<13}  {:<12}  {:<5}  {}",
            job.offset,
            job.identifier,
            job.job_type.name(),
            styled_status(job.status),
            job.run_count,
            style(job.message.as_deref().unwrap_or("")).dim()
        );
    }
}
