//! In-process simulation of the copy engine and cluster filesystems.
//!
//! [`SimulatedEngine`] runs copy jobs against a script of outcomes without
//! touching any cluster. [`MemoryFs`] keeps directories, snapshots and the
//! changes made since the newest snapshot in memory. Both are used by the
//! CLI in local mode and throughout the test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::engine::CopyEngine;
use crate::error::{EngineError, EngineResult};
use crate::fs::{filesystem_root, ClusterFs, DiffEntry, FsRegistry, SnapshotInfo, CURRENT_STATE};
use crate::job::{
    CopyCounters, CopyJobId, CopyJobReport, RunState, JOB_COUNTER_GROUP, NUM_COMPLETED_MAPS,
    NUM_FAILED_MAPS, NUM_KILLED_MAPS, TOTAL_LAUNCHED_MAPS,
};
use crate::options::CopyOptions;

fn lock<T>(mutex: &Mutex<T>) -> EngineResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| EngineError::Internal(format!("lock poisoned: {e}")))
}

/// Scripted outcome of a simulated copy job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOutcome {
    /// Finish successfully once the run time elapsed.
    Succeed,
    /// Fail with the given reason once the run time elapsed.
    Fail(String),
    /// Keep running until killed.
    Hang,
}

struct SimJob {
    options: Option<CopyOptions>,
    state: RunState,
    outcome: SimOutcome,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    ready_at: Instant,
}

/// Simulated copy engine.
///
/// Outcomes are taken from the script in submission order; once the script
/// is exhausted every job succeeds. A job reports `Prep` until it is first
/// observed, then `Running` until its run time has elapsed.
pub struct SimulatedEngine {
    name: String,
    jobs: Mutex<FxHashMap<CopyJobId, SimJob>>,
    script: Mutex<VecDeque<SimOutcome>>,
    submit_failures: Mutex<VecDeque<String>>,
    hidden: Mutex<FxHashMap<CopyJobId, u32>>,
    submitted: Mutex<Vec<CopyOptions>>,
    filesystems: Mutex<Vec<Arc<MemoryFs>>>,
    counter: AtomicU64,
    kills: AtomicUsize,
    run_time: Duration,
    maps: u64,
}

impl SimulatedEngine {
    /// Create an engine whose jobs finish on first observation.
    pub fn new() -> Self {
        Self {
            name: "simulated".to_string(),
            jobs: Mutex::new(FxHashMap::default()),
            script: Mutex::new(VecDeque::new()),
            submit_failures: Mutex::new(VecDeque::new()),
            hidden: Mutex::new(FxHashMap::default()),
            submitted: Mutex::new(Vec::new()),
            filesystems: Mutex::new(Vec::new()),
            counter: AtomicU64::new(1),
            kills: AtomicUsize::new(0),
            run_time: Duration::ZERO,
            maps: 20,
        }
    }

    /// Set how long each job runs before reaching its outcome.
    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    /// Set the number of map tasks reported per job.
    pub fn with_maps(mut self, maps: u64) -> Self {
        self.maps = maps;
        self
    }

    /// Append outcomes to the script.
    pub fn script(&self, outcomes: impl IntoIterator<Item = SimOutcome>) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(outcomes);
        }
    }

    /// Make the next submission fail with the given reason.
    pub fn fail_next_submit(&self, reason: impl Into<String>) {
        if let Ok(mut failures) = self.submit_failures.lock() {
            failures.push_back(reason.into());
        }
    }

    /// Let a successful recovery copy restore the target on this filesystem.
    pub fn attach_filesystem(&self, fs: Arc<MemoryFs>) {
        if let Ok(mut filesystems) = self.filesystems.lock() {
            filesystems.push(fs);
        }
    }

    /// Register a job that was submitted outside this process, e.g. by a
    /// scheduler instance that crashed.
    pub fn seed_job(&self, job_id: impl Into<CopyJobId>, state: RunState) {
        let now = Utc::now();
        let job = SimJob {
            options: None,
            finished_at: state.is_terminal().then_some(now),
            state,
            outcome: SimOutcome::Succeed,
            started_at: now,
            ready_at: Instant::now() + self.run_time,
        };
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(job_id.into(), job);
        }
    }

    /// Make the next `lookups` lookups of a job return nothing.
    pub fn hide_job(&self, job_id: impl Into<CopyJobId>, lookups: u32) {
        if let Ok(mut hidden) = self.hidden.lock() {
            hidden.insert(job_id.into(), lookups);
        }
    }

    /// Number of accepted submissions.
    pub fn submissions(&self) -> usize {
        self.submitted.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Options of every accepted submission, in order.
    pub fn submitted(&self) -> Vec<CopyOptions> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of kill requests that hit an active job.
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Current state of a job, without advancing it.
    pub fn state_of(&self, job_id: &CopyJobId) -> Option<RunState> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.get(job_id).map(|j| j.state.clone()))
    }

    fn next_id(&self) -> CopyJobId {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        CopyJobId::new(format!("job_sim_{seq:04}"))
    }

    fn advance(&self, job: &mut SimJob) -> EngineResult<()> {
        if !job.state.is_active() {
            return Ok(());
        }
        if job.state == RunState::Prep {
            job.state = RunState::Running;
        }
        if Instant::now() < job.ready_at {
            return Ok(());
        }
        job.state = match &job.outcome {
            SimOutcome::Succeed => RunState::Succeeded,
            SimOutcome::Fail(reason) => RunState::Failed(reason.clone()),
            SimOutcome::Hang => return Ok(()),
        };
        job.finished_at = Some(Utc::now());

        if job.state.is_success() {
            if let Some(options) = job.options.as_ref().filter(|o| o.recovery) {
                let root = filesystem_root(&options.target);
                for fs in lock(&self.filesystems)?.iter() {
                    if fs.uri() == root {
                        fs.clear_changes(&options.target)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn counters(&self, state: &RunState) -> CopyCounters {
        let maps = self.maps;
        match state {
            RunState::Prep | RunState::Unknown(_) => CopyCounters::new(),
            RunState::Running => CopyCounters::new()
                .with(JOB_COUNTER_GROUP, TOTAL_LAUNCHED_MAPS, maps)
                .with(JOB_COUNTER_GROUP, NUM_COMPLETED_MAPS, maps / 2),
            RunState::Succeeded => CopyCounters::new()
                .with(JOB_COUNTER_GROUP, TOTAL_LAUNCHED_MAPS, maps)
                .with(JOB_COUNTER_GROUP, NUM_COMPLETED_MAPS, maps),
            RunState::Failed(_) => CopyCounters::new()
                .with(JOB_COUNTER_GROUP, TOTAL_LAUNCHED_MAPS, maps)
                .with(JOB_COUNTER_GROUP, NUM_FAILED_MAPS, 1)
                .with(JOB_COUNTER_GROUP, NUM_COMPLETED_MAPS, maps.saturating_sub(1)),
            RunState::Killed => CopyCounters::new()
                .with(JOB_COUNTER_GROUP, TOTAL_LAUNCHED_MAPS, maps)
                .with(JOB_COUNTER_GROUP, NUM_KILLED_MAPS, maps / 2)
                .with(JOB_COUNTER_GROUP, NUM_COMPLETED_MAPS, maps / 2),
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CopyEngine for SimulatedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, options: &CopyOptions) -> EngineResult<CopyJobId> {
        options.validate()?;
        if let Some(reason) = lock(&self.submit_failures)?.pop_front() {
            return Err(EngineError::SubmissionFailed(reason));
        }

        let outcome = lock(&self.script)?
            .pop_front()
            .unwrap_or(SimOutcome::Succeed);
        let job_id = self.next_id();
        debug!(job_id = %job_id, ?outcome, "Simulated copy job submitted");

        lock(&self.jobs)?.insert(
            job_id.clone(),
            SimJob {
                options: Some(options.clone()),
                state: RunState::Prep,
                outcome,
                started_at: Utc::now(),
                finished_at: None,
                ready_at: Instant::now() + self.run_time,
            },
        );
        lock(&self.submitted)?.push(options.clone());
        Ok(job_id)
    }

    async fn lookup(&self, job_id: &CopyJobId) -> EngineResult<Option<CopyJobReport>> {
        {
            let mut hidden = lock(&self.hidden)?;
            if let Some(remaining) = hidden.get_mut(job_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(None);
                }
            }
        }

        let mut jobs = lock(&self.jobs)?;
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(None);
        };
        self.advance(job)?;

        Ok(Some(CopyJobReport {
            job_id: job_id.clone(),
            counters: self.counters(&job.state),
            state: job.state.clone(),
            started_at: job.started_at,
            finished_at: job.finished_at,
        }))
    }

    async fn kill(&self, job_id: &CopyJobId) -> EngineResult<()> {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        if job.state.is_active() {
            job.state = RunState::Killed;
            job.finished_at = Some(Utc::now());
            self.kills.fetch_add(1, Ordering::SeqCst);
            debug!(job_id = %job_id, "Simulated copy job killed");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DirState {
    snapshottable: bool,
    snapshots: Vec<SnapshotInfo>,
    changes: Vec<DiffEntry>,
}

/// In-memory cluster filesystem.
///
/// Only changes made since the newest snapshot are tracked, so a diff from
/// any snapshot to [`CURRENT_STATE`] reports those changes and a diff between
/// two snapshots is empty.
#[derive(Debug)]
pub struct MemoryFs {
    uri: String,
    dirs: Mutex<FxHashMap<String, DirState>>,
    open_handles: AtomicUsize,
}

impl MemoryFs {
    /// Create a filesystem serving the root `uri`.
    pub fn new(uri: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.into(),
            dirs: Mutex::new(FxHashMap::default()),
            open_handles: AtomicUsize::new(0),
        })
    }

    /// Create a directory.
    pub fn add_dir(&self, path: &str, snapshottable: bool) {
        if let Ok(mut dirs) = self.dirs.lock() {
            let dir = dirs.entry(path.to_string()).or_default();
            dir.snapshottable = snapshottable;
        }
    }

    /// Add a snapshot with an explicit creation time.
    pub fn add_snapshot_at(&self, path: &str, name: &str, created_at: DateTime<Utc>) {
        if let Ok(mut dirs) = self.dirs.lock() {
            let dir = dirs.entry(path.to_string()).or_default();
            dir.snapshots.push(SnapshotInfo {
                name: name.to_string(),
                created_at,
            });
            dir.snapshots.sort_by_key(|s| s.created_at);
        }
    }

    /// Record a change to a directory since its newest snapshot.
    pub fn record_change(&self, path: &str, entry: DiffEntry) {
        if let Ok(mut dirs) = self.dirs.lock() {
            dirs.entry(path.to_string()).or_default().changes.push(entry);
        }
    }

    /// Forget the changes recorded for a directory.
    pub fn clear_changes(&self, path: &str) -> EngineResult<()> {
        if let Some(dir) = lock(&self.dirs)?.get_mut(path) {
            dir.changes.clear();
        }
        Ok(())
    }

    /// Names of the snapshots of a directory, oldest first.
    pub fn snapshot_names(&self, path: &str) -> Vec<String> {
        self.dirs
            .lock()
            .ok()
            .and_then(|dirs| {
                dirs.get(path)
                    .map(|d| d.snapshots.iter().map(|s| s.name.clone()).collect())
            })
            .unwrap_or_default()
    }

    /// Number of handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Open a new handle.
    pub fn handle(self: &Arc<Self>) -> Arc<dyn ClusterFs> {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        self.clone()
    }

    /// Register this filesystem under its root URI.
    pub fn register(self: &Arc<Self>, registry: &mut FsRegistry) {
        let fs = Arc::clone(self);
        registry.register(self.uri.clone(), move |_| Ok(fs.handle()));
    }

    fn missing(path: &str) -> EngineError {
        EngineError::Filesystem(format!("no such directory: {path}"))
    }
}

#[async_trait]
impl ClusterFs for MemoryFs {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn exists(&self, path: &str) -> EngineResult<bool> {
        Ok(lock(&self.dirs)?.contains_key(path))
    }

    async fn is_snapshottable(&self, path: &str) -> EngineResult<bool> {
        Ok(lock(&self.dirs)?
            .get(path)
            .map(|d| d.snapshottable)
            .unwrap_or(false))
    }

    async fn create_snapshot(&self, path: &str, name: &str) -> EngineResult<()> {
        let mut dirs = lock(&self.dirs)?;
        let dir = dirs.get_mut(path).ok_or_else(|| Self::missing(path))?;
        if !dir.snapshottable {
            return Err(EngineError::Snapshot(format!(
                "directory is not snapshottable: {path}"
            )));
        }
        if dir.snapshots.iter().any(|s| s.name == name) {
            return Err(EngineError::Snapshot(format!(
                "snapshot {name} already exists on {path}"
            )));
        }
        dir.snapshots.push(SnapshotInfo {
            name: name.to_string(),
            created_at: Utc::now(),
        });
        dir.changes.clear();
        Ok(())
    }

    async fn list_snapshots(&self, path: &str) -> EngineResult<Vec<SnapshotInfo>> {
        let dirs = lock(&self.dirs)?;
        let dir = dirs.get(path).ok_or_else(|| Self::missing(path))?;
        Ok(dir.snapshots.clone())
    }

    async fn delete_snapshot(&self, path: &str, name: &str) -> EngineResult<()> {
        let mut dirs = lock(&self.dirs)?;
        let dir = dirs.get_mut(path).ok_or_else(|| Self::missing(path))?;
        let before = dir.snapshots.len();
        dir.snapshots.retain(|s| s.name != name);
        if dir.snapshots.len() == before {
            return Err(EngineError::Snapshot(format!(
                "snapshot {name} not found on {path}"
            )));
        }
        Ok(())
    }

    async fn snapshot_diff(
        &self,
        path: &str,
        from: &str,
        to: &str,
    ) -> EngineResult<Vec<DiffEntry>> {
        let dirs = lock(&self.dirs)?;
        let dir = dirs.get(path).ok_or_else(|| Self::missing(path))?;
        let known = |name: &str| dir.snapshots.iter().any(|s| s.name == name);
        if !known(from) {
            return Err(EngineError::Snapshot(format!(
                "snapshot {from} not found on {path}"
            )));
        }
        if to == CURRENT_STATE {
            return Ok(dir.changes.clone());
        }
        if !known(to) {
            return Err(EngineError::Snapshot(format!(
                "snapshot {to} not found on {path}"
            )));
        }
        Ok(Vec::new())
    }

    async fn close(&self) -> EngineResult<()> {
        let _ = self
            .open_handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Ok(())
    }
}
