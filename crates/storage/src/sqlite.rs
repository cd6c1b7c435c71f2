// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite storage backend.
//!
//! Column conventions: timestamps are fixed-width ISO-8601 UTC strings
//! (millisecond precision, `Z` suffix) so lexicographic comparison in SQL
//! matches chronological order; JSON payloads are TEXT; booleans are 0/1
//! INTEGERs. The atomic claim is a conditional UPDATE keyed on
//! `status = 'pending'` — the cross-worker exclusion primitive.

use crate::adapter::{JobStore, ProcessStore, StorageError, WorkflowStore};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dl_core::{
    InstanceUpdate, Job, JobFilter, JobStatus, JobUpdate, ManagedProcess, ProcStatus, ProcUpdate,
    WorkflowInstance, WorkflowStatus,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Open (or create) the database with the pragmas the whole system relies
/// on: shared cache so the isolated workflow runner can attach to the same
/// file, WAL journaling, and a busy timeout instead of immediate SQLITE_BUSY.
pub async fn open_pool(path: &Path) -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .shared_cache(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn fmt_ts_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(fmt_ts)
}

fn parse_ts(s: &str, column: &'static str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt { column, message: e.to_string() })
}

fn parse_ts_opt(
    s: Option<String>,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    s.map(|s| parse_ts(&s, column)).transpose()
}

/// Parse an enum stored as its wire (snake/kebab case) name.
fn parse_enum<T: DeserializeOwned>(s: &str, column: &'static str) -> Result<T, StorageError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|e| StorageError::Corrupt { column, message: e.to_string() })
}

fn parse_json(s: &str, column: &'static str) -> Result<Value, StorageError> {
    serde_json::from_str(s).map_err(|e| StorageError::Corrupt { column, message: e.to_string() })
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

const JOBS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    payload        TEXT NOT NULL,
    status         TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    run_at         TEXT,
    started_at     TEXT,
    completed_at   TEXT,
    attempts       INTEGER NOT NULL DEFAULT 0,
    max_attempts   INTEGER NOT NULL DEFAULT 3,
    last_error     TEXT,
    result         TEXT,
    external       INTEGER NOT NULL DEFAULT 0,
    pid            INTEGER,
    socket_path    TEXT,
    tcp_port       INTEGER,
    last_heartbeat TEXT,
    process_state  TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
CREATE INDEX IF NOT EXISTS idx_jobs_name ON jobs (name);
CREATE INDEX IF NOT EXISTS idx_jobs_status_run_at ON jobs (status, run_at);
"#;

const JOB_COLUMNS: &str = "id, name, payload, status, created_at, run_at, started_at, \
     completed_at, attempts, max_attempts, last_error, result, external, pid, socket_path, \
     tcp_port, last_heartbeat, process_state";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    name: String,
    payload: String,
    status: String,
    created_at: String,
    run_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    attempts: i64,
    max_attempts: i64,
    last_error: Option<String>,
    result: Option<String>,
    external: i64,
    pid: Option<i64>,
    socket_path: Option<String>,
    tcp_port: Option<i64>,
    last_heartbeat: Option<String>,
    process_state: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = StorageError;

    fn try_from(row: JobRow) -> Result<Self, StorageError> {
        Ok(Job {
            id: row.id.into(),
            name: row.name,
            payload: parse_json(&row.payload, "payload")?,
            status: parse_enum(&row.status, "status")?,
            created_at: parse_ts(&row.created_at, "created_at")?,
            run_at: parse_ts_opt(row.run_at, "run_at")?,
            started_at: parse_ts_opt(row.started_at, "started_at")?,
            completed_at: parse_ts_opt(row.completed_at, "completed_at")?,
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
            last_error: row.last_error,
            result: row.result.as_deref().map(|s| parse_json(s, "result")).transpose()?,
            external: row.external != 0,
            pid: row.pid.map(|p| p as u32),
            socket_path: row.socket_path.map(Into::into),
            tcp_port: row.tcp_port.map(|p| p as u16),
            last_heartbeat: parse_ts_opt(row.last_heartbeat, "last_heartbeat")?,
            process_state: row
                .process_state
                .as_deref()
                .map(|s| parse_enum(s, "process_state"))
                .transpose()?,
        })
    }
}

/// SQLite-backed jobs table.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    stopped: Arc<AtomicBool>,
}

impl SqliteJobStore {
    /// Create the store, bootstrapping the schema if needed.
    pub async fn open(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::raw_sql(JOBS_SCHEMA).execute(&pool).await?;
        Ok(Self { pool, stopped: Arc::new(AtomicBool::new(false)) })
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn write(&self, job: &Job, insert: bool) -> Result<(), StorageError> {
        let sql = if insert {
            format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
        } else {
            "UPDATE jobs SET name = ?2, payload = ?3, status = ?4, created_at = ?5, \
             run_at = ?6, started_at = ?7, completed_at = ?8, attempts = ?9, \
             max_attempts = ?10, last_error = ?11, result = ?12, external = ?13, \
             pid = ?14, socket_path = ?15, tcp_port = ?16, last_heartbeat = ?17, \
             process_state = ?18 WHERE id = ?1"
                .to_string()
        };
        sqlx::query(&sql)
            .bind(job.id.as_str())
            .bind(&job.name)
            .bind(serde_json::to_string(&job.payload)?)
            .bind(job.status.to_string())
            .bind(fmt_ts(job.created_at))
            .bind(fmt_ts_opt(job.run_at))
            .bind(fmt_ts_opt(job.started_at))
            .bind(fmt_ts_opt(job.completed_at))
            .bind(job.attempts as i64)
            .bind(job.max_attempts as i64)
            .bind(&job.last_error)
            .bind(job.result.as_ref().map(serde_json::to_string).transpose()?)
            .bind(job.external as i64)
            .bind(job.pid.map(|p| p as i64))
            .bind(job.socket_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
            .bind(job.tcp_port.map(|p| p as i64))
            .bind(fmt_ts_opt(job.last_heartbeat))
            .bind(job.process_state.map(|s| s.to_string()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select(&self, where_clause: &str, binds: &[String]) -> Result<Vec<Job>, StorageError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs {where_clause}");
        let mut query = sqlx::query_as::<_, JobRow>(&sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Job::try_from).collect()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &Job) -> Result<(), StorageError> {
        if self.is_stopped() {
            return Ok(());
        }
        self.write(job, true).await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StorageError> {
        if self.is_stopped() {
            return Ok(None);
        }
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<(), StorageError> {
        if self.is_stopped() || update.is_empty() {
            return Ok(());
        }
        // Read-modify-write through the shared apply so partial-update
        // semantics match the memory backend exactly. Records are
        // single-writer by contract of the owning engines; the only
        // concurrent transition is the claim, which uses a conditional
        // UPDATE.
        let Some(mut job) = self.get(id).await? else {
            return Ok(());
        };
        update.apply(&mut job);
        self.write(&job, false).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        if self.is_stopped() {
            return Ok(false);
        }
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        if self.is_stopped() {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(fmt_ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        self.select(
            "WHERE status = ? ORDER BY created_at ASC",
            &[status.to_string()],
        )
        .await
    }

    async fn get_by_name(
        &self,
        name: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        match status {
            Some(status) => {
                self.select(
                    "WHERE name = ? AND status = ? ORDER BY created_at ASC",
                    &[name.to_string(), status.to_string()],
                )
                .await
            }
            None => {
                self.select("WHERE name = ? ORDER BY created_at ASC", &[name.to_string()])
                    .await
            }
        }
    }

    async fn get_scheduled_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        self.select(
            "WHERE status = 'scheduled' AND run_at IS NOT NULL AND run_at <= ? \
             ORDER BY run_at ASC",
            &[fmt_ts(now)],
        )
        .await
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<Job>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        self.select(
            &format!("WHERE status = 'pending' ORDER BY created_at ASC LIMIT {limit}"),
            &[],
        )
        .await
    }

    async fn get_running_external(&self) -> Result<Vec<Job>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        self.select(
            "WHERE status = 'running' AND external = 1 ORDER BY created_at ASC",
            &[],
        )
        .await
    }

    async fn get_all(&self, filter: JobFilter) -> Result<Vec<Job>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            binds.push(status.to_string());
        }
        if let Some(ref name) = filter.name {
            clauses.push("name = ?");
            binds.push(name.clone());
        }
        if let Some(external) = filter.external {
            clauses.push("external = ?");
            binds.push(if external { "1".into() } else { "0".into() });
        }
        let mut where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {} ", clauses.join(" AND "))
        };
        where_clause.push_str("ORDER BY created_at ASC");
        if let Some(limit) = filter.limit {
            where_clause.push_str(&format!(" LIMIT {limit}"));
        }
        self.select(&where_clause, &binds).await
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        if self.is_stopped() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') \
             AND completed_at IS NOT NULL AND completed_at < ?",
        )
        .bind(fmt_ts(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// workflow_instances
// ---------------------------------------------------------------------------

const WORKFLOWS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_instances (
    id               TEXT PRIMARY KEY,
    workflow_name    TEXT NOT NULL,
    status           TEXT NOT NULL,
    current_step     TEXT,
    input            TEXT NOT NULL,
    output           TEXT,
    error            TEXT,
    step_results     TEXT NOT NULL,
    branch_instances TEXT NOT NULL,
    parent_id        TEXT,
    branch_name      TEXT,
    metadata         TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    completed_at     TEXT
);
CREATE INDEX IF NOT EXISTS idx_workflow_instances_status ON workflow_instances (status);
CREATE INDEX IF NOT EXISTS idx_workflow_instances_name_status
    ON workflow_instances (workflow_name, status);
"#;

const INSTANCE_COLUMNS: &str = "id, workflow_name, status, current_step, input, output, error, \
     step_results, branch_instances, parent_id, branch_name, metadata, created_at, started_at, \
     completed_at";

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    workflow_name: String,
    status: String,
    current_step: Option<String>,
    input: String,
    output: Option<String>,
    error: Option<String>,
    step_results: String,
    branch_instances: String,
    parent_id: Option<String>,
    branch_name: Option<String>,
    metadata: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<InstanceRow> for WorkflowInstance {
    type Error = StorageError;

    fn try_from(row: InstanceRow) -> Result<Self, StorageError> {
        Ok(WorkflowInstance {
            id: row.id.into(),
            workflow_name: row.workflow_name,
            status: parse_enum(&row.status, "status")?,
            current_step: row.current_step,
            input: parse_json(&row.input, "input")?,
            output: row.output.as_deref().map(|s| parse_json(s, "output")).transpose()?,
            error: row.error,
            step_results: serde_json::from_str(&row.step_results).map_err(|e| {
                StorageError::Corrupt { column: "step_results", message: e.to_string() }
            })?,
            branch_instances: serde_json::from_str(&row.branch_instances).map_err(|e| {
                StorageError::Corrupt { column: "branch_instances", message: e.to_string() }
            })?,
            parent_id: row.parent_id.map(Into::into),
            branch_name: row.branch_name,
            metadata: serde_json::from_str(&row.metadata).map_err(|e| {
                StorageError::Corrupt { column: "metadata", message: e.to_string() }
            })?,
            created_at: parse_ts(&row.created_at, "created_at")?,
            started_at: parse_ts_opt(row.started_at, "started_at")?,
            completed_at: parse_ts_opt(row.completed_at, "completed_at")?,
        })
    }
}

/// SQLite-backed workflow instances table.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
    stopped: Arc<AtomicBool>,
}

impl SqliteWorkflowStore {
    pub async fn open(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::raw_sql(WORKFLOWS_SCHEMA).execute(&pool).await?;
        Ok(Self { pool, stopped: Arc::new(AtomicBool::new(false)) })
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn write(&self, instance: &WorkflowInstance, insert: bool) -> Result<(), StorageError> {
        let sql = if insert {
            format!(
                "INSERT INTO workflow_instances ({INSTANCE_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            )
        } else {
            "UPDATE workflow_instances SET workflow_name = ?2, status = ?3, current_step = ?4, \
             input = ?5, output = ?6, error = ?7, step_results = ?8, branch_instances = ?9, \
             parent_id = ?10, branch_name = ?11, metadata = ?12, created_at = ?13, \
             started_at = ?14, completed_at = ?15 WHERE id = ?1"
                .to_string()
        };
        sqlx::query(&sql)
            .bind(instance.id.as_str())
            .bind(&instance.workflow_name)
            .bind(instance.status.to_string())
            .bind(&instance.current_step)
            .bind(serde_json::to_string(&instance.input)?)
            .bind(instance.output.as_ref().map(serde_json::to_string).transpose()?)
            .bind(&instance.error)
            .bind(serde_json::to_string(&instance.step_results)?)
            .bind(serde_json::to_string(&instance.branch_instances)?)
            .bind(instance.parent_id.as_ref().map(|p| p.to_string()))
            .bind(&instance.branch_name)
            .bind(serde_json::to_string(&instance.metadata)?)
            .bind(fmt_ts(instance.created_at))
            .bind(fmt_ts_opt(instance.started_at))
            .bind(fmt_ts_opt(instance.completed_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select(
        &self,
        where_clause: &str,
        binds: &[String],
    ) -> Result<Vec<WorkflowInstance>, StorageError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances {where_clause}");
        let mut query = sqlx::query_as::<_, InstanceRow>(&sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(WorkflowInstance::try_from).collect()
    }
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StorageError> {
        if self.is_stopped() {
            return Ok(());
        }
        self.write(instance, true).await
    }

    async fn get(&self, id: &str) -> Result<Option<WorkflowInstance>, StorageError> {
        if self.is_stopped() {
            return Ok(None);
        }
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?");
        let row = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WorkflowInstance::try_from).transpose()
    }

    async fn update(&self, id: &str, update: InstanceUpdate) -> Result<(), StorageError> {
        if self.is_stopped() {
            return Ok(());
        }
        let Some(mut instance) = self.get(id).await? else {
            return Ok(());
        };
        update.apply(&mut instance);
        self.write(&instance, false).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        if self.is_stopped() {
            return Ok(false);
        }
        let result = sqlx::query("DELETE FROM workflow_instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        self.select(
            "WHERE status = ? ORDER BY created_at ASC",
            &[status.to_string()],
        )
        .await
    }

    async fn get_by_name(
        &self,
        workflow_name: &str,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        match status {
            Some(status) => {
                self.select(
                    "WHERE workflow_name = ? AND status = ? ORDER BY created_at ASC",
                    &[workflow_name.to_string(), status.to_string()],
                )
                .await
            }
            None => {
                self.select(
                    "WHERE workflow_name = ? ORDER BY created_at ASC",
                    &[workflow_name.to_string()],
                )
                .await
            }
        }
    }

    async fn get_running(&self) -> Result<Vec<WorkflowInstance>, StorageError> {
        self.get_by_status(WorkflowStatus::Running).await
    }

    async fn count_running(&self, workflow_name: Option<&str>) -> Result<usize, StorageError> {
        if self.is_stopped() {
            return Ok(0);
        }
        let row = match workflow_name {
            Some(name) => {
                sqlx::query(
                    "SELECT COUNT(*) AS n FROM workflow_instances \
                     WHERE status IN ('pending', 'running') AND workflow_name = ?",
                )
                .bind(name)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT COUNT(*) AS n FROM workflow_instances \
                     WHERE status IN ('pending', 'running')",
                )
                .fetch_one(&self.pool)
                .await?
            }
        };
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        if self.is_stopped() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM workflow_instances \
             WHERE status IN ('completed', 'failed', 'cancelled', 'timed_out') \
             AND completed_at IS NOT NULL AND completed_at < ?",
        )
        .bind(fmt_ts(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// managed_processes
// ---------------------------------------------------------------------------

const PROCESSES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS managed_processes (
    id                    TEXT PRIMARY KEY,
    name                  TEXT NOT NULL,
    pid                   INTEGER,
    socket_path           TEXT,
    tcp_port              INTEGER,
    status                TEXT NOT NULL,
    spec                  TEXT NOT NULL,
    created_at            TEXT NOT NULL,
    started_at            TEXT,
    stopped_at            TEXT,
    last_heartbeat        TEXT,
    restart_count         INTEGER NOT NULL DEFAULT 0,
    consecutive_failures  INTEGER NOT NULL DEFAULT 0,
    error                 TEXT
);
CREATE INDEX IF NOT EXISTS idx_managed_processes_status ON managed_processes (status);
"#;

const PROC_COLUMNS: &str = "id, name, pid, socket_path, tcp_port, status, spec, created_at, \
     started_at, stopped_at, last_heartbeat, restart_count, consecutive_failures, error";

#[derive(sqlx::FromRow)]
struct ProcRow {
    id: String,
    name: String,
    pid: Option<i64>,
    socket_path: Option<String>,
    tcp_port: Option<i64>,
    status: String,
    spec: String,
    created_at: String,
    started_at: Option<String>,
    stopped_at: Option<String>,
    last_heartbeat: Option<String>,
    restart_count: i64,
    consecutive_failures: i64,
    error: Option<String>,
}

impl TryFrom<ProcRow> for ManagedProcess {
    type Error = StorageError;

    fn try_from(row: ProcRow) -> Result<Self, StorageError> {
        Ok(ManagedProcess {
            id: row.id.into(),
            name: row.name,
            pid: row.pid.map(|p| p as u32),
            socket_path: row.socket_path.map(Into::into),
            tcp_port: row.tcp_port.map(|p| p as u16),
            status: parse_enum(&row.status, "status")?,
            spec: serde_json::from_str(&row.spec)
                .map_err(|e| StorageError::Corrupt { column: "spec", message: e.to_string() })?,
            created_at: parse_ts(&row.created_at, "created_at")?,
            started_at: parse_ts_opt(row.started_at, "started_at")?,
            stopped_at: parse_ts_opt(row.stopped_at, "stopped_at")?,
            last_heartbeat: parse_ts_opt(row.last_heartbeat, "last_heartbeat")?,
            restart_count: row.restart_count as u32,
            consecutive_failures: row.consecutive_failures as u32,
            error: row.error,
        })
    }
}

/// SQLite-backed managed processes table.
#[derive(Clone)]
pub struct SqliteProcessStore {
    pool: SqlitePool,
    stopped: Arc<AtomicBool>,
}

impl SqliteProcessStore {
    pub async fn open(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::raw_sql(PROCESSES_SCHEMA).execute(&pool).await?;
        Ok(Self { pool, stopped: Arc::new(AtomicBool::new(false)) })
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn write(&self, proc: &ManagedProcess, insert: bool) -> Result<(), StorageError> {
        let sql = if insert {
            format!(
                "INSERT INTO managed_processes ({PROC_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            )
        } else {
            "UPDATE managed_processes SET name = ?2, pid = ?3, socket_path = ?4, tcp_port = ?5, \
             status = ?6, spec = ?7, created_at = ?8, started_at = ?9, stopped_at = ?10, \
             last_heartbeat = ?11, restart_count = ?12, consecutive_failures = ?13, error = ?14 \
             WHERE id = ?1"
                .to_string()
        };
        sqlx::query(&sql)
            .bind(proc.id.as_str())
            .bind(&proc.name)
            .bind(proc.pid.map(|p| p as i64))
            .bind(proc.socket_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
            .bind(proc.tcp_port.map(|p| p as i64))
            .bind(proc.status.to_string())
            .bind(serde_json::to_string(&proc.spec)?)
            .bind(fmt_ts(proc.created_at))
            .bind(fmt_ts_opt(proc.started_at))
            .bind(fmt_ts_opt(proc.stopped_at))
            .bind(fmt_ts_opt(proc.last_heartbeat))
            .bind(proc.restart_count as i64)
            .bind(proc.consecutive_failures as i64)
            .bind(&proc.error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select(
        &self,
        where_clause: &str,
        binds: &[String],
    ) -> Result<Vec<ManagedProcess>, StorageError> {
        let sql = format!("SELECT {PROC_COLUMNS} FROM managed_processes {where_clause}");
        let mut query = sqlx::query_as::<_, ProcRow>(&sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(ManagedProcess::try_from).collect()
    }
}

#[async_trait]
impl ProcessStore for SqliteProcessStore {
    async fn create(&self, proc: &ManagedProcess) -> Result<(), StorageError> {
        if self.is_stopped() {
            return Ok(());
        }
        self.write(proc, true).await
    }

    async fn get(&self, id: &str) -> Result<Option<ManagedProcess>, StorageError> {
        if self.is_stopped() {
            return Ok(None);
        }
        let sql = format!("SELECT {PROC_COLUMNS} FROM managed_processes WHERE id = ?");
        let row = sqlx::query_as::<_, ProcRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ManagedProcess::try_from).transpose()
    }

    async fn update(&self, id: &str, update: ProcUpdate) -> Result<(), StorageError> {
        if self.is_stopped() {
            return Ok(());
        }
        let Some(mut proc) = self.get(id).await? else {
            return Ok(());
        };
        update.apply(&mut proc);
        self.write(&proc, false).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        if self.is_stopped() {
            return Ok(false);
        }
        let result = sqlx::query("DELETE FROM managed_processes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_by_status(&self, status: ProcStatus) -> Result<Vec<ManagedProcess>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        self.select(
            "WHERE status = ? ORDER BY created_at ASC",
            &[status.to_string()],
        )
        .await
    }

    async fn get_by_name(&self, name: &str) -> Result<Vec<ManagedProcess>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        self.select(
            "WHERE name = ? ORDER BY created_at ASC",
            &[name.to_string()],
        )
        .await
    }

    async fn get_running(&self) -> Result<Vec<ManagedProcess>, StorageError> {
        self.get_by_status(ProcStatus::Running).await
    }

    async fn get_orphaned(&self) -> Result<Vec<ManagedProcess>, StorageError> {
        self.get_by_status(ProcStatus::Orphaned).await
    }

    async fn get_all(&self) -> Result<Vec<ManagedProcess>, StorageError> {
        if self.is_stopped() {
            return Ok(Vec::new());
        }
        self.select("ORDER BY created_at ASC", &[]).await
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        if self.is_stopped() {
            return Ok(0);
        }
        let result = sqlx::query(
            "DELETE FROM managed_processes WHERE status IN ('stopped', 'dead') \
             AND stopped_at IS NOT NULL AND stopped_at < ?",
        )
        .bind(fmt_ts(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
