//! SQLite-based persistence for production use.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::cluster::{ClusterPair, PairStatus};
use crate::error::{SchedError, SchedResult};
use crate::instance::{InstanceFilter, InstanceId, InstanceJob, PolicyInstance};
use crate::job::{JobStatus, ReplicationJobDetail, ReplicationType};
use crate::metrics::{ReplicationMetrics, TrackingInfo};
use crate::persistence::StateStore;
use crate::policy::ReplicationPolicy;

const INSTANCE_COLUMNS: &str = "instance_id, policy_name, status, run_count, current_offset, \
     message, created_at, start_time, end_time, terminal, retirement_time";

const JOB_COLUMNS: &str = "instance_id, job_offset, identifier, job_type, status, start_time, \
     end_time, message, context_data, run_count, retirement_time";

const PAIR_COLUMNS: &str = "cluster_name, cluster_version, paired_cluster_name, \
     paired_cluster_version, status, last_modified";

/// Timestamps are stored with fixed millisecond precision so that string
/// comparison in SQL orders them correctly.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> SchedResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SchedError::DatabaseError(format!("invalid timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> SchedResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

struct InstanceRow {
    instance_id: String,
    policy_name: String,
    status: String,
    run_count: u32,
    current_offset: usize,
    message: Option<String>,
    created_at: String,
    start_time: Option<String>,
    end_time: Option<String>,
    terminal: bool,
    retirement_time: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            instance_id: row.get(0)?,
            policy_name: row.get(1)?,
            status: row.get(2)?,
            run_count: row.get(3)?,
            current_offset: row.get(4)?,
            message: row.get(5)?,
            created_at: row.get(6)?,
            start_time: row.get(7)?,
            end_time: row.get(8)?,
            terminal: row.get(9)?,
            retirement_time: row.get(10)?,
        })
    }

    fn into_instance(self) -> SchedResult<PolicyInstance> {
        let id = InstanceId::parse(&self.instance_id).ok_or_else(|| {
            SchedError::DatabaseError(format!("invalid instance id '{}'", self.instance_id))
        })?;
        Ok(PolicyInstance {
            id,
            policy_name: self.policy_name,
            status: self.status.parse()?,
            run_count: self.run_count,
            current_offset: self.current_offset,
            message: self.message,
            created_at: parse_ts(&self.created_at)?,
            start_time: parse_opt_ts(self.start_time)?,
            end_time: parse_opt_ts(self.end_time)?,
            terminal: self.terminal,
            retirement_time: parse_opt_ts(self.retirement_time)?,
        })
    }
}

struct JobRow {
    instance_id: String,
    offset: usize,
    identifier: String,
    job_type: String,
    status: String,
    start_time: Option<String>,
    end_time: Option<String>,
    message: Option<String>,
    context_data: Option<String>,
    run_count: u32,
    retirement_time: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            instance_id: row.get(0)?,
            offset: row.get(1)?,
            identifier: row.get(2)?,
            job_type: row.get(3)?,
            status: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            message: row.get(7)?,
            context_data: row.get(8)?,
            run_count: row.get(9)?,
            retirement_time: row.get(10)?,
        })
    }

    fn into_job(self) -> SchedResult<InstanceJob> {
        let instance_id = InstanceId::parse(&self.instance_id).ok_or_else(|| {
            SchedError::DatabaseError(format!("invalid instance id '{}'", self.instance_id))
        })?;
        let job_type: ReplicationType = self.job_type.parse()?;
        Ok(InstanceJob {
            instance_id,
            offset: self.offset,
            identifier: self.identifier,
            job_type,
            status: self.status.parse()?,
            start_time: parse_opt_ts(self.start_time)?,
            end_time: parse_opt_ts(self.end_time)?,
            message: self.message,
            context_data: self.context_data,
            run_count: self.run_count,
            retirement_time: parse_opt_ts(self.retirement_time)?,
        })
    }
}

fn pair_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, i64, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

/// Status and run count of one instance-job row.
fn job_state(
    tx: &Transaction<'_>,
    instance_id: &InstanceId,
    offset: usize,
) -> SchedResult<(JobStatus, u32, Option<String>)> {
    let row: Option<(String, u32, Option<String>)> = tx
        .query_row(
            "SELECT status, run_count, start_time FROM instance_jobs
             WHERE instance_id = ?1 AND job_offset = ?2",
            params![instance_id.as_str(), offset],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let (status, run_count, start_time) = row.ok_or_else(|| SchedError::InstanceJobNotFound {
        instance_id: instance_id.to_string(),
        offset,
    })?;
    Ok((status.parse()?, run_count, start_time))
}

/// Status, run count and terminal flag of one instance row.
fn instance_state(
    tx: &Transaction<'_>,
    instance_id: &InstanceId,
) -> SchedResult<(JobStatus, u32, bool)> {
    let row: Option<(String, u32, bool)> = tx
        .query_row(
            "SELECT status, run_count, terminal FROM policy_instances WHERE instance_id = ?1",
            params![instance_id.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let (status, run_count, terminal) =
        row.ok_or_else(|| SchedError::InstanceNotFound(instance_id.to_string()))?;
    Ok((status.parse()?, run_count, terminal))
}

fn check_run_count(instance_id: &InstanceId, expected: u32, found: u32) -> SchedResult<()> {
    if expected != found {
        return Err(SchedError::StaleRunCount {
            instance_id: instance_id.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Reject a start at `offset` while an earlier offset has not succeeded.
fn check_order(tx: &Transaction<'_>, instance_id: &InstanceId, offset: usize) -> SchedResult<()> {
    let pending: i64 = tx.query_row(
        "SELECT COUNT(*) FROM instance_jobs
         WHERE instance_id = ?1 AND job_offset < ?2 AND status != 'SUCCESS'",
        params![instance_id.as_str(), offset],
        |r| r.get(0),
    )?;
    if pending > 0 {
        return Err(SchedError::OutOfOrder {
            instance_id: instance_id.to_string(),
            offset,
        });
    }
    Ok(())
}

fn invalid_transition(
    instance_id: &InstanceId,
    offset: usize,
    from: JobStatus,
    to: JobStatus,
) -> SchedError {
    SchedError::InvalidTransition {
        instance_id: instance_id.to_string(),
        offset,
        from: from.name().to_string(),
        to: to.name().to_string(),
    }
}

/// SQLite-based state store.
///
/// Provides persistent storage with ACID guarantees. Every mutating
/// operation runs in its own transaction.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new(path: impl AsRef<Path>) -> SchedResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    /// Create a new in-memory SQLite store.
    pub fn in_memory() -> SchedResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    fn lock(&self) -> SchedResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SchedError::DatabaseError(e.to_string()))
    }

    fn init_schema_sync(&self) -> SchedResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS policies (
                name TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS policy_sequences (
                policy_name TEXT PRIMARY KEY,
                last_sequence INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS policy_instances (
                instance_id TEXT PRIMARY KEY,
                policy_name TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                status TEXT NOT NULL,
                run_count INTEGER NOT NULL DEFAULT 0,
                current_offset INTEGER NOT NULL DEFAULT 0,
                message TEXT,
                tracking_info TEXT,
                created_at TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                terminal INTEGER NOT NULL DEFAULT 0,
                retirement_time TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_instances_policy ON policy_instances(policy_name);
            CREATE INDEX IF NOT EXISTS idx_instances_status ON policy_instances(status);
            CREATE INDEX IF NOT EXISTS idx_instances_end_time ON policy_instances(end_time);

            CREATE TABLE IF NOT EXISTS instance_jobs (
                instance_id TEXT NOT NULL,
                job_offset INTEGER NOT NULL,
                identifier TEXT NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                message TEXT,
                context_data TEXT,
                run_count INTEGER NOT NULL DEFAULT 0,
                retirement_time TEXT,
                PRIMARY KEY (instance_id, job_offset),
                FOREIGN KEY (instance_id) REFERENCES policy_instances(instance_id)
            );

            CREATE TABLE IF NOT EXISTS cluster_pairs (
                cluster_name TEXT NOT NULL,
                cluster_version INTEGER NOT NULL,
                paired_cluster_name TEXT NOT NULL,
                paired_cluster_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                last_modified TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pairs_cluster
                ON cluster_pairs(cluster_name, cluster_version);
            CREATE INDEX IF NOT EXISTS idx_pairs_peer
                ON cluster_pairs(paired_cluster_name, paired_cluster_version);
            "#,
        )?;
        Ok(())
    }

    /// Insert a cluster pair row without the uniqueness check.
    #[cfg(test)]
    pub(crate) fn insert_pair_row(&self, pair: &ClusterPair) -> SchedResult<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT INTO cluster_pairs ({PAIR_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                pair.cluster_name,
                pair.cluster_version,
                pair.paired_cluster_name,
                pair.paired_cluster_version,
                pair.status.name(),
                ts(pair.last_modified),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn save_policy(&self, policy: &ReplicationPolicy) -> SchedResult<()> {
        let conn = self.lock()?;
        let data = serde_json::to_string(policy)?;

        conn.execute(
            "INSERT OR REPLACE INTO policies (name, data, updated_at) VALUES (?1, ?2, ?3)",
            params![policy.name, data, ts(Utc::now())],
        )?;
        Ok(())
    }

    async fn load_policy(&self, name: &str) -> SchedResult<Option<ReplicationPolicy>> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM policies WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(SchedError::from))
            .transpose()
    }

    async fn list_policies(&self) -> SchedResult<Vec<ReplicationPolicy>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT data FROM policies ORDER BY name")?;
        let mut rows = stmt.query([])?;

        let mut policies = Vec::new();
        while let Some(row) = rows.next()? {
            let data: String = row.get(0)?;
            policies.push(serde_json::from_str(&data)?);
        }
        Ok(policies)
    }

    async fn create_instance(
        &self,
        policy_name: &str,
        chain: &[ReplicationJobDetail],
        created_at: DateTime<Utc>,
    ) -> SchedResult<PolicyInstance> {
        if chain.is_empty() {
            return Err(SchedError::EmptyChain);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO policy_sequences (policy_name, last_sequence) VALUES (?1, 1)
            ON CONFLICT(policy_name) DO UPDATE SET last_sequence = last_sequence + 1
            "#,
            params![policy_name],
        )?;
        let sequence: u64 = tx.query_row(
            "SELECT last_sequence FROM policy_sequences WHERE policy_name = ?1",
            params![policy_name],
            |r| r.get(0),
        )?;
        let id = InstanceId::new(policy_name, sequence);

        tx.execute(
            r#"
            INSERT INTO policy_instances
                (instance_id, policy_name, sequence, status, run_count, current_offset, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)
            "#,
            params![
                id.as_str(),
                policy_name,
                sequence,
                JobStatus::NotStarted.name(),
                ts(created_at),
            ],
        )?;

        {
            let mut insert = tx.prepare(
                r#"
                INSERT INTO instance_jobs
                    (instance_id, job_offset, identifier, job_type, status, run_count)
                VALUES (?1, ?2, ?3, ?4, ?5, 0)
                "#,
            )?;
            for (offset, detail) in chain.iter().enumerate() {
                insert.execute(params![
                    id.as_str(),
                    offset,
                    detail.identifier(),
                    detail.job_type().name(),
                    JobStatus::NotStarted.name(),
                ])?;
            }
        }
        tx.commit()?;

        Ok(PolicyInstance {
            id,
            policy_name: policy_name.to_string(),
            status: JobStatus::NotStarted,
            run_count: 0,
            current_offset: 0,
            message: None,
            created_at: parse_ts(&ts(created_at))?,
            start_time: None,
            end_time: None,
            terminal: false,
            retirement_time: None,
        })
    }

    async fn load_instance(
        &self,
        instance_id: &InstanceId,
    ) -> SchedResult<Option<PolicyInstance>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM policy_instances WHERE instance_id = ?1"),
                params![instance_id.as_str()],
                InstanceRow::from_row,
            )
            .optional()?;
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> SchedResult<Vec<PolicyInstance>> {
        let conn = self.lock()?;

        let mut sql = format!("SELECT {INSTANCE_COLUMNS} FROM policy_instances WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref policy) = filter.policy_name {
            params.push(Box::new(policy.clone()));
            sql.push_str(&format!(" AND policy_name = ?{}", params.len()));
        }

        if let Some(ref statuses) = filter.status {
            let mut placeholders = Vec::with_capacity(statuses.len());
            for s in statuses {
                params.push(Box::new(s.name()));
                placeholders.push(format!("?{}", params.len()));
            }
            sql.push_str(&format!(" AND status IN ({})", placeholders.join(", ")));
        }

        if !filter.include_retired {
            sql.push_str(" AND retirement_time IS NULL");
        }

        sql.push_str(" ORDER BY created_at DESC, sequence DESC");

        if let Some(limit) = filter.limit {
            params.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), InstanceRow::from_row)?;

        let mut instances = Vec::new();
        for row in rows {
            instances.push(row?.into_instance()?);
        }
        Ok(instances)
    }

    async fn get_instance_job(
        &self,
        instance_id: &InstanceId,
        offset: usize,
    ) -> SchedResult<InstanceJob> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM instance_jobs \
                     WHERE instance_id = ?1 AND job_offset = ?2"
                ),
                params![instance_id.as_str(), offset],
                JobRow::from_row,
            )
            .optional()?;
        row.ok_or_else(|| SchedError::InstanceJobNotFound {
            instance_id: instance_id.to_string(),
            offset,
        })?
        .into_job()
    }

    async fn instance_jobs(&self, instance_id: &InstanceId) -> SchedResult<Vec<InstanceJob>> {
        let conn = self.lock()?;

        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM policy_instances WHERE instance_id = ?1",
                params![instance_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(SchedError::InstanceNotFound(instance_id.to_string()));
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM instance_jobs WHERE instance_id = ?1 ORDER BY job_offset"
        ))?;
        let rows = stmt.query_map(params![instance_id.as_str()], JobRow::from_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }

    async fn increment_run_count(
        &self,
        instance_id: &InstanceId,
        offset: usize,
        expected_run_count: u32,
        now: DateTime<Utc>,
    ) -> SchedResult<u32> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let (status, run_count, terminal) = instance_state(&tx, instance_id)?;
        check_run_count(instance_id, expected_run_count, run_count)?;
        if terminal || status == JobStatus::Running || status == JobStatus::Success {
            return Err(invalid_transition(
                instance_id,
                offset,
                status,
                JobStatus::Running,
            ));
        }
        job_state(&tx, instance_id, offset)?;
        check_order(&tx, instance_id, offset)?;

        let next = run_count + 1;
        let updated = tx.execute(
            r#"
            UPDATE policy_instances
            SET run_count = ?1, status = ?2, current_offset = ?3, message = NULL,
                tracking_info = NULL, start_time = ?4, end_time = NULL
            WHERE instance_id = ?5 AND run_count = ?6
            "#,
            params![
                next,
                JobStatus::Running.name(),
                offset,
                ts(now),
                instance_id.as_str(),
                run_count,
            ],
        )?;
        if updated != 1 {
            return Err(SchedError::InconsistentState(format!(
                "run count update of {instance_id} touched {updated} rows"
            )));
        }

        tx.execute(
            r#"
            UPDATE instance_jobs
            SET status = ?1, start_time = NULL, end_time = NULL, message = NULL,
                context_data = NULL, run_count = ?2
            WHERE instance_id = ?3 AND job_offset >= ?4 AND status != 'SUCCESS'
            "#,
            params![
                JobStatus::NotStarted.name(),
                next,
                instance_id.as_str(),
                offset,
            ],
        )?;
        tx.commit()?;
        Ok(next)
    }

    async fn record_start(
        &self,
        instance_id: &InstanceId,
        offset: usize,
        run_count: u32,
        start_time: DateTime<Utc>,
    ) -> SchedResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let (status, stored_run_count, stored_start) = job_state(&tx, instance_id, offset)?;
        check_run_count(instance_id, run_count, stored_run_count)?;
        match status {
            JobStatus::NotStarted => {}
            JobStatus::Running if stored_start.as_deref() == Some(ts(start_time).as_str()) => {
                return Ok(());
            }
            other => {
                return Err(invalid_transition(
                    instance_id,
                    offset,
                    other,
                    JobStatus::Running,
                ));
            }
        }
        check_order(&tx, instance_id, offset)?;

        tx.execute(
            r#"
            UPDATE instance_jobs SET status = ?1, start_time = ?2
            WHERE instance_id = ?3 AND job_offset = ?4 AND run_count = ?5 AND status = ?6
            "#,
            params![
                JobStatus::Running.name(),
                ts(start_time),
                instance_id.as_str(),
                offset,
                run_count,
                JobStatus::NotStarted.name(),
            ],
        )?;
        tx.execute(
            r#"
            UPDATE policy_instances SET current_offset = ?1, tracking_info = NULL
            WHERE instance_id = ?2 AND run_count = ?3
            "#,
            params![offset, instance_id.as_str(), run_count],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn record_completion(
        &self,
        instance_id: &InstanceId,
        offset: usize,
        run_count: u32,
        status: JobStatus,
        message: &str,
        end_time: DateTime<Utc>,
        context_data: Option<&str>,
    ) -> SchedResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let (current, stored_run_count, _) = job_state(&tx, instance_id, offset)?;
        check_run_count(instance_id, run_count, stored_run_count)?;
        if current != JobStatus::Running || !status.is_terminal() {
            return Err(invalid_transition(instance_id, offset, current, status));
        }

        tx.execute(
            r#"
            UPDATE instance_jobs
            SET status = ?1, message = ?2, end_time = ?3,
                context_data = COALESCE(?4, context_data)
            WHERE instance_id = ?5 AND job_offset = ?6 AND run_count = ?7
            "#,
            params![
                status.name(),
                message,
                ts(end_time),
                context_data,
                instance_id.as_str(),
                offset,
                run_count,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn save_job_context(
        &self,
        instance_id: &InstanceId,
        offset: usize,
        run_count: u32,
        context_data: &str,
    ) -> SchedResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let (current, stored_run_count, _) = job_state(&tx, instance_id, offset)?;
        check_run_count(instance_id, run_count, stored_run_count)?;
        if current != JobStatus::Running {
            return Err(invalid_transition(instance_id, offset, current, current));
        }

        tx.execute(
            "UPDATE instance_jobs SET context_data = ?1 WHERE instance_id = ?2 AND job_offset = ?3",
            params![context_data, instance_id.as_str(), offset],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn finish_attempt(
        &self,
        instance_id: &InstanceId,
        run_count: u32,
        status: JobStatus,
        message: &str,
        end_time: DateTime<Utc>,
        terminal: bool,
    ) -> SchedResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let (current, stored_run_count, _) = instance_state(&tx, instance_id)?;
        check_run_count(instance_id, run_count, stored_run_count)?;
        if current != JobStatus::Running || !status.is_terminal() {
            let offset: usize = tx.query_row(
                "SELECT current_offset FROM policy_instances WHERE instance_id = ?1",
                params![instance_id.as_str()],
                |r| r.get(0),
            )?;
            return Err(invalid_transition(instance_id, offset, current, status));
        }

        tx.execute(
            r#"
            UPDATE policy_instances
            SET status = ?1, message = ?2, end_time = ?3, terminal = ?4
            WHERE instance_id = ?5 AND run_count = ?6
            "#,
            params![
                status.name(),
                message,
                ts(end_time),
                terminal,
                instance_id.as_str(),
                run_count,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn close_instance(
        &self,
        instance_id: &InstanceId,
        status: JobStatus,
        message: &str,
        end_time: DateTime<Utc>,
    ) -> SchedResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let (current, _, _) = instance_state(&tx, instance_id)?;
        if current == JobStatus::Running || !status.is_terminal() {
            let offset: usize = tx.query_row(
                "SELECT current_offset FROM policy_instances WHERE instance_id = ?1",
                params![instance_id.as_str()],
                |r| r.get(0),
            )?;
            return Err(invalid_transition(instance_id, offset, current, status));
        }

        tx.execute(
            r#"
            UPDATE policy_instances
            SET status = ?1, message = ?2, end_time = COALESCE(end_time, ?3), terminal = 1
            WHERE instance_id = ?4
            "#,
            params![status.name(), message, ts(end_time), instance_id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn abort_instance(
        &self,
        instance_id: &InstanceId,
        status: JobStatus,
        message: &str,
        end_time: DateTime<Utc>,
    ) -> SchedResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let (current, _, terminal) = instance_state(&tx, instance_id)?;
        if !status.is_terminal() {
            let offset: usize = tx.query_row(
                "SELECT current_offset FROM policy_instances WHERE instance_id = ?1",
                params![instance_id.as_str()],
                |r| r.get(0),
            )?;
            return Err(invalid_transition(instance_id, offset, current, status));
        }
        if terminal {
            return Ok(false);
        }

        tx.execute(
            r#"
            UPDATE instance_jobs
            SET status = ?1, message = ?2, end_time = ?3
            WHERE instance_id = ?4 AND status = 'RUNNING'
            "#,
            params![status.name(), message, ts(end_time), instance_id.as_str()],
        )?;
        tx.execute(
            r#"
            UPDATE policy_instances
            SET status = ?1, message = ?2, end_time = ?3, terminal = 1
            WHERE instance_id = ?4
            "#,
            params![status.name(), message, ts(end_time), instance_id.as_str()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn record_metrics(
        &self,
        instance_id: &InstanceId,
        metrics: &ReplicationMetrics,
    ) -> SchedResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let stored: Option<Option<String>> = tx
            .query_row(
                "SELECT tracking_info FROM policy_instances WHERE instance_id = ?1",
                params![instance_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        let stored = stored.ok_or_else(|| SchedError::InstanceNotFound(instance_id.to_string()))?;

        let mut info = match stored {
            Some(json) => TrackingInfo::from_json(&json)?,
            None => TrackingInfo::new(),
        };
        info.record(metrics.clone())?;

        tx.execute(
            "UPDATE policy_instances SET tracking_info = ?1 WHERE instance_id = ?2",
            params![info.to_json()?, instance_id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn load_tracking_info(&self, instance_id: &InstanceId) -> SchedResult<TrackingInfo> {
        let conn = self.lock()?;
        let stored: Option<Option<String>> = conn
            .query_row(
                "SELECT tracking_info FROM policy_instances WHERE instance_id = ?1",
                params![instance_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        match stored {
            None => Err(SchedError::InstanceNotFound(instance_id.to_string())),
            Some(None) => Ok(TrackingInfo::new()),
            Some(Some(json)) => TrackingInfo::from_json(&json),
        }
    }

    async fn mark_retired(
        &self,
        instance_id: &InstanceId,
        retirement_time: DateTime<Utc>,
    ) -> SchedResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let (status, _, terminal) = instance_state(&tx, instance_id)?;
        if !terminal {
            let offset: usize = tx.query_row(
                "SELECT current_offset FROM policy_instances WHERE instance_id = ?1",
                params![instance_id.as_str()],
                |r| r.get(0),
            )?;
            return Err(SchedError::InvalidTransition {
                instance_id: instance_id.to_string(),
                offset,
                from: status.to_string(),
                to: "RETIRED".to_string(),
            });
        }

        let updated = tx.execute(
            r#"
            UPDATE policy_instances SET retirement_time = ?1
            WHERE instance_id = ?2 AND retirement_time IS NULL
            "#,
            params![ts(retirement_time), instance_id.as_str()],
        )?;
        tx.execute(
            r#"
            UPDATE instance_jobs SET retirement_time = ?1
            WHERE instance_id = ?2 AND retirement_time IS NULL
            "#,
            params![ts(retirement_time), instance_id.as_str()],
        )?;
        tx.commit()?;
        Ok(updated > 0)
    }

    async fn retire_completed_before(
        &self,
        cutoff: DateTime<Utc>,
        retirement_time: DateTime<Utc>,
    ) -> SchedResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            UPDATE instance_jobs SET retirement_time = ?1
            WHERE retirement_time IS NULL AND instance_id IN (
                SELECT instance_id FROM policy_instances
                WHERE terminal = 1 AND retirement_time IS NULL
                AND end_time IS NOT NULL AND end_time < ?2
            )
            "#,
            params![ts(retirement_time), ts(cutoff)],
        )?;
        let retired = tx.execute(
            r#"
            UPDATE policy_instances SET retirement_time = ?1
            WHERE terminal = 1 AND retirement_time IS NULL
            AND end_time IS NOT NULL AND end_time < ?2
            "#,
            params![ts(retirement_time), ts(cutoff)],
        )?;
        tx.commit()?;
        Ok(retired)
    }

    async fn purge_retired_before(&self, cutoff: DateTime<Utc>) -> SchedResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        // Rows first (foreign key)
        tx.execute(
            r#"
            DELETE FROM instance_jobs WHERE instance_id IN (
                SELECT instance_id FROM policy_instances
                WHERE retirement_time IS NOT NULL AND retirement_time < ?1
            )
            "#,
            params![ts(cutoff)],
        )?;
        let purged = tx.execute(
            r#"
            DELETE FROM policy_instances
            WHERE retirement_time IS NOT NULL AND retirement_time < ?1
            "#,
            params![ts(cutoff)],
        )?;
        tx.commit()?;
        Ok(purged)
    }

    async fn pair_clusters(&self, pair: &ClusterPair) -> SchedResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let rowids: Vec<i64> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT rowid FROM cluster_pairs
                WHERE cluster_name = ?1 AND cluster_version = ?2
                AND paired_cluster_name = ?3 AND paired_cluster_version = ?4
                "#,
            )?;
            let rows = stmt.query_map(
                params![
                    pair.cluster_name,
                    pair.cluster_version,
                    pair.paired_cluster_name,
                    pair.paired_cluster_version,
                ],
                |r| r.get(0),
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        match rowids.as_slice() {
            [] => {
                tx.execute(
                    &format!(
                        "INSERT INTO cluster_pairs ({PAIR_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                    ),
                    params![
                        pair.cluster_name,
                        pair.cluster_version,
                        pair.paired_cluster_name,
                        pair.paired_cluster_version,
                        pair.status.name(),
                        ts(pair.last_modified),
                    ],
                )?;
            }
            [rowid] => {
                tx.execute(
                    "UPDATE cluster_pairs SET status = ?1, last_modified = ?2 WHERE rowid = ?3",
                    params![pair.status.name(), ts(pair.last_modified), rowid],
                )?;
            }
            rows => {
                return Err(SchedError::InconsistentState(format!(
                    "{} rows pair {}/{} with {}/{}",
                    rows.len(),
                    pair.cluster_name,
                    pair.cluster_version,
                    pair.paired_cluster_name,
                    pair.paired_cluster_version
                )));
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn paired_clusters(&self, name: &str, version: i64) -> SchedResult<Vec<ClusterPair>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {PAIR_COLUMNS} FROM cluster_pairs
            WHERE (cluster_name = ?1 AND cluster_version = ?2)
               OR (paired_cluster_name = ?1 AND paired_cluster_version = ?2)
            ORDER BY last_modified
            "#
        ))?;
        let rows = stmt.query_map(params![name, version], pair_from_row)?;

        let mut pairs = Vec::new();
        for row in rows {
            let (cluster_name, cluster_version, paired_name, paired_version, status, modified) =
                row?;
            let status: PairStatus = status.parse()?;
            pairs.push(ClusterPair {
                cluster_name,
                cluster_version,
                paired_cluster_name: paired_name,
                paired_cluster_version: paired_version,
                status,
                last_modified: parse_ts(&modified)?,
            });
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::build_chain;
    use crate::metrics::MetricsJobType;
    use chrono::Duration;
    use ferry_engine::CopyJobId;

    fn chain(policy: &str) -> Vec<ReplicationJobDetail> {
        build_chain(&[ReplicationJobDetail::new(
            "fs-1",
            policy,
            ReplicationType::Hdfs,
            None,
        )])
        .unwrap()
    }

    async fn launched(store: &SqliteStore) -> PolicyInstance {
        let instance = store
            .create_instance("p1", &chain("p1"), Utc::now())
            .await
            .unwrap();
        store
            .increment_run_count(&instance.id, 0, 0, Utc::now())
            .await
            .unwrap();
        store.load_instance(&instance.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_create_instance() {
        let store = SqliteStore::in_memory().unwrap();

        let first = store
            .create_instance("p1", &chain("p1"), Utc::now())
            .await
            .unwrap();
        let second = store
            .create_instance("p1", &chain("p1"), Utc::now())
            .await
            .unwrap();
        assert_eq!(first.id.as_str(), "p1@1");
        assert_eq!(second.id.as_str(), "p1@2");
        assert_eq!(first.status, JobStatus::NotStarted);

        let jobs = store.instance_jobs(&first.id).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].job_type, ReplicationType::Start);
        assert_eq!(jobs[1].identifier, "fs-1");
        assert!(jobs.iter().all(|j| j.status == JobStatus::NotStarted));

        assert!(matches!(
            store.create_instance("p1", &[], Utc::now()).await,
            Err(SchedError::EmptyChain)
        ));
    }

    #[tokio::test]
    async fn test_missing_row_vs_not_started() {
        let store = SqliteStore::in_memory().unwrap();
        let instance = store
            .create_instance("p1", &chain("p1"), Utc::now())
            .await
            .unwrap();

        let job = store.get_instance_job(&instance.id, 1).await.unwrap();
        assert_eq!(job.status, JobStatus::NotStarted);

        assert!(matches!(
            store.get_instance_job(&instance.id, 9).await,
            Err(SchedError::InstanceJobNotFound { offset: 9, .. })
        ));
        assert!(matches!(
            store.instance_jobs(&InstanceId::new("p1", 99)).await,
            Err(SchedError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_record_start_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let instance = launched(&store).await;
        let start = Utc::now();

        store.record_start(&instance.id, 0, 1, start).await.unwrap();
        store.record_start(&instance.id, 0, 1, start).await.unwrap();

        let other = start + Duration::seconds(5);
        assert!(matches!(
            store.record_start(&instance.id, 0, 1, other).await,
            Err(SchedError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.record_start(&instance.id, 0, 7, start).await,
            Err(SchedError::StaleRunCount { .. })
        ));
    }

    #[tokio::test]
    async fn test_offsets_in_order() {
        let store = SqliteStore::in_memory().unwrap();
        let instance = launched(&store).await;
        let now = Utc::now();

        assert!(matches!(
            store.record_start(&instance.id, 1, 1, now).await,
            Err(SchedError::OutOfOrder { offset: 1, .. })
        ));

        store.record_start(&instance.id, 0, 1, now).await.unwrap();
        store
            .record_completion(&instance.id, 0, 1, JobStatus::Success, "SUCCESS", now, None)
            .await
            .unwrap();
        store.record_start(&instance.id, 1, 1, now).await.unwrap();

        let loaded = store.load_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_offset, 1);
    }

    #[tokio::test]
    async fn test_completion_only_from_running() {
        let store = SqliteStore::in_memory().unwrap();
        let instance = launched(&store).await;
        let now = Utc::now();

        assert!(matches!(
            store
                .record_completion(&instance.id, 0, 1, JobStatus::Success, "ok", now, None)
                .await,
            Err(SchedError::InvalidTransition { .. })
        ));

        store.record_start(&instance.id, 0, 1, now).await.unwrap();
        store
            .record_completion(&instance.id, 0, 1, JobStatus::Failed, "boom", now, Some("ctx"))
            .await
            .unwrap();

        // Terminal rows are never overwritten
        assert!(matches!(
            store
                .record_completion(&instance.id, 0, 1, JobStatus::Success, "ok", now, None)
                .await,
            Err(SchedError::InvalidTransition { .. })
        ));

        let job = store.get_instance_job(&instance.id, 0).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message.as_deref(), Some("boom"));
        assert_eq!(job.context_data.as_deref(), Some("ctx"));
    }

    #[tokio::test]
    async fn test_increment_run_count() {
        let store = SqliteStore::in_memory().unwrap();
        let instance = launched(&store).await;
        let now = Utc::now();
        let id = instance.id.clone();

        // START succeeds, the copy fails
        store.record_start(&id, 0, 1, now).await.unwrap();
        store
            .record_completion(&id, 0, 1, JobStatus::Success, "SUCCESS", now, None)
            .await
            .unwrap();
        store.record_start(&id, 1, 1, now).await.unwrap();
        store
            .record_metrics(
                &id,
                &ReplicationMetrics::launched(&CopyJobId::new("job_1"), MetricsJobType::Main),
            )
            .await
            .unwrap();
        store
            .record_completion(&id, 1, 1, JobStatus::Failed, "copy failed", now, None)
            .await
            .unwrap();

        // Launch while running is rejected
        assert!(matches!(
            store.increment_run_count(&id, 1, 1, now).await,
            Err(SchedError::InvalidTransition { .. })
        ));
        store
            .finish_attempt(&id, 1, JobStatus::Failed, "copy failed", now, false)
            .await
            .unwrap();

        assert!(matches!(
            store.increment_run_count(&id, 1, 0, now).await,
            Err(SchedError::StaleRunCount { expected: 0, found: 1, .. })
        ));
        assert!(matches!(
            store.increment_run_count(&id, 2, 1, now).await,
            Err(SchedError::OutOfOrder { .. })
        ));

        assert_eq!(store.increment_run_count(&id, 1, 1, now).await.unwrap(), 2);

        let jobs = store.instance_jobs(&id).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Success);
        assert_eq!(jobs[0].run_count, 1);
        assert_eq!(jobs[1].status, JobStatus::NotStarted);
        assert_eq!(jobs[1].run_count, 2);
        assert!(jobs[1].message.is_none());
        assert!(store.load_tracking_info(&id).await.unwrap().is_empty());

        let loaded = store.load_instance(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.run_count, 2);
        assert!(loaded.end_time.is_none());

        // A writer still on attempt 1 is rejected
        assert!(matches!(
            store.record_start(&id, 1, 1, now).await,
            Err(SchedError::StaleRunCount { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_instance() {
        let store = SqliteStore::in_memory().unwrap();
        let instance = launched(&store).await;
        let now = Utc::now();

        assert!(matches!(
            store
                .close_instance(&instance.id, JobStatus::Killed, "cancelled", now)
                .await,
            Err(SchedError::InvalidTransition { .. })
        ));

        store
            .finish_attempt(&instance.id, 1, JobStatus::Failed, "boom", now, false)
            .await
            .unwrap();
        store
            .close_instance(&instance.id, JobStatus::Killed, "cancelled", now)
            .await
            .unwrap();

        let loaded = store.load_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Killed);
        assert!(loaded.terminal);
        assert!(matches!(
            store.increment_run_count(&instance.id, 1, 1, now).await,
            Err(SchedError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_running_instance() {
        let store = SqliteStore::in_memory().unwrap();
        let instance = launched(&store).await;
        let now = Utc::now();
        store.record_start(&instance.id, 0, 1, now).await.unwrap();

        assert!(matches!(
            store
                .abort_instance(&instance.id, JobStatus::Running, "x", now)
                .await,
            Err(SchedError::InvalidTransition { .. })
        ));
        assert!(store
            .abort_instance(&instance.id, JobStatus::Failed, "chain mismatch", now)
            .await
            .unwrap());

        let loaded = store.load_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert!(loaded.terminal);
        assert_eq!(loaded.message.as_deref(), Some("chain mismatch"));
        let jobs = store.instance_jobs(&instance.id).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].message.as_deref(), Some("chain mismatch"));
        assert_eq!(jobs[1].status, JobStatus::NotStarted);

        // A terminal instance is left alone
        assert!(!store
            .abort_instance(&instance.id, JobStatus::Killed, "cancelled", now)
            .await
            .unwrap());
        let loaded = store.load_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_mark_retired_requires_terminal() {
        let store = SqliteStore::in_memory().unwrap();
        let instance = launched(&store).await;
        let now = Utc::now();

        assert!(matches!(
            store.mark_retired(&instance.id, now).await,
            Err(SchedError::InvalidTransition { .. })
        ));
        assert!(store
            .list_instances(&InstanceFilter::all())
            .await
            .unwrap()
            .iter()
            .any(|i| i.id == instance.id));

        store
            .finish_attempt(&instance.id, 1, JobStatus::Success, "SUCCESS", now, true)
            .await
            .unwrap();
        assert!(store.mark_retired(&instance.id, now).await.unwrap());
        assert!(!store.mark_retired(&instance.id, now).await.unwrap());
        assert!(store
            .list_instances(&InstanceFilter::all())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_retire_and_purge() {
        let store = SqliteStore::in_memory().unwrap();
        let old = launched(&store).await;
        let live = launched(&store).await;
        let ended = Utc::now() - Duration::days(10);

        store
            .finish_attempt(&old.id, 1, JobStatus::Success, "SUCCESS", ended, true)
            .await
            .unwrap();

        let retired = store
            .retire_completed_before(Utc::now() - Duration::days(1), Utc::now() - Duration::days(2))
            .await
            .unwrap();
        assert_eq!(retired, 1);

        let visible = store.list_instances(&InstanceFilter::all()).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, live.id);
        let all = store
            .list_instances(&InstanceFilter::all().with_retired())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let purged = store
            .purge_retired_before(Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.load_instance(&old.id).await.unwrap().is_none());

        // Sequence numbers are not reused after a purge
        let next = store
            .create_instance("p1", &chain("p1"), Utc::now())
            .await
            .unwrap();
        assert_eq!(next.id.as_str(), "p1@3");
    }

    #[tokio::test]
    async fn test_list_instances_filter() {
        let store = SqliteStore::in_memory().unwrap();
        let a = launched(&store).await;
        store
            .create_instance("p2", &chain("p2"), Utc::now())
            .await
            .unwrap();

        let running = store.list_instances(&InstanceFilter::running()).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);

        let p2 = store
            .list_instances(&InstanceFilter::all().with_policy("p2"))
            .await
            .unwrap();
        assert_eq!(p2.len(), 1);
        assert_eq!(p2[0].status, JobStatus::NotStarted);

        let limited = store
            .list_instances(&InstanceFilter::all().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_pair_clusters_upsert() {
        let store = SqliteStore::in_memory().unwrap();

        let pair = ClusterPair::new("primary", 1, "backup", 1, PairStatus::Paired);
        store.pair_clusters(&pair).await.unwrap();
        let suspended = ClusterPair::new("primary", 1, "backup", 1, PairStatus::Suspended);
        store.pair_clusters(&suspended).await.unwrap();

        let pairs = store.paired_clusters("primary", 1).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].status, PairStatus::Suspended);

        // Either side of the pair finds it
        let from_peer = store.paired_clusters("backup", 1).await.unwrap();
        assert_eq!(from_peer.len(), 1);
        assert!(store.paired_clusters("backup", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pair_clusters_inconsistent() {
        let store = SqliteStore::in_memory().unwrap();
        let pair = ClusterPair::new("primary", 1, "backup", 1, PairStatus::Paired);
        store.insert_pair_row(&pair).unwrap();
        store.insert_pair_row(&pair).unwrap();

        assert!(matches!(
            store.pair_clusters(&pair).await,
            Err(SchedError::InconsistentState(_))
        ));
        assert_eq!(store.paired_clusters("primary", 1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_store_file_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.db");

        let id = {
            let store = SqliteStore::new(&path).unwrap();
            let policy = ReplicationPolicy::new("p1").with_job("t", ReplicationType::Test, []);
            store.save_policy(&policy).await.unwrap();
            launched(&store).await.id
        };

        let store = SqliteStore::new(&path).unwrap();
        assert!(store.load_policy("p1").await.unwrap().is_some());
        assert_eq!(store.list_policies().await.unwrap().len(), 1);
        let instance = store.load_instance(&id).await.unwrap().unwrap();
        assert_eq!(instance.status, JobStatus::Running);
        assert_eq!(instance.run_count, 1);
    }
}
