// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job record and partial-update types.

use crate::id::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Lifecycle status of a job. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

crate::simple_display! {
    JobStatus {
        Pending => "pending",
        Scheduled => "scheduled",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
}

/// State of the spawned OS process backing an external job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Spawning,
    Running,
    Orphaned,
    Reconnecting,
}

crate::simple_display! {
    ProcessState {
        Spawning => "spawning",
        Running => "running",
        Orphaned => "orphaned",
        Reconnecting => "reconnecting",
    }
}

/// One unit of background work.
///
/// The record is the source of truth: it outlives the process that created
/// it, and recovery after a parent restart starts from what is persisted
/// here, not from in-memory state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Handler selector (registered name).
    pub name: String,
    /// Opaque payload passed to the handler.
    pub payload: Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Scheduled future run time; only meaningful while `status == Scheduled`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Handler result, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// True when the handler runs in a separately spawned OS process.
    #[serde(default)]
    pub external: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_state: Option<ProcessState>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(name: impl Into<String>, payload: Value, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            payload,
            status: JobStatus::Pending,
            created_at: now,
            run_at: None,
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts,
            last_error: None,
            result: None,
            external: false,
            pid: None,
            socket_path: None,
            tcp_port: None,
            last_heartbeat: None,
            process_state: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Partial update for a job record.
///
/// `Option<T>` fields: `None` leaves the column untouched. Nullable columns
/// use `Option<Option<T>>` so "set to null" (`Some(None)`) and "not
/// provided" (`None`) stay distinguishable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub run_at: Option<Option<DateTime<Utc>>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub attempts: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub result: Option<Option<Value>>,
    pub pid: Option<Option<u32>>,
    pub socket_path: Option<Option<PathBuf>>,
    pub tcp_port: Option<Option<u16>>,
    pub last_heartbeat: Option<Option<DateTime<Utc>>>,
    pub process_state: Option<Option<ProcessState>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, v: JobStatus) -> Self {
        self.status = Some(v);
        self
    }

    pub fn run_at(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.run_at = Some(v);
        self
    }

    pub fn started_at(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(v);
        self
    }

    pub fn completed_at(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.completed_at = Some(v);
        self
    }

    pub fn attempts(mut self, v: u32) -> Self {
        self.attempts = Some(v);
        self
    }

    pub fn last_error(mut self, v: Option<String>) -> Self {
        self.last_error = Some(v);
        self
    }

    pub fn result(mut self, v: Option<Value>) -> Self {
        self.result = Some(v);
        self
    }

    pub fn pid(mut self, v: Option<u32>) -> Self {
        self.pid = Some(v);
        self
    }

    pub fn socket_path(mut self, v: Option<PathBuf>) -> Self {
        self.socket_path = Some(v);
        self
    }

    pub fn tcp_port(mut self, v: Option<u16>) -> Self {
        self.tcp_port = Some(v);
        self
    }

    pub fn last_heartbeat(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.last_heartbeat = Some(v);
        self
    }

    pub fn process_state(mut self, v: Option<ProcessState>) -> Self {
        self.process_state = Some(v);
        self
    }

    /// Apply the update to an in-memory record. Both storage backends route
    /// through this so partial-update semantics stay identical.
    pub fn apply(&self, job: &mut Job) {
        if let Some(v) = self.status {
            job.status = v;
        }
        if let Some(ref v) = self.run_at {
            job.run_at = *v;
        }
        if let Some(ref v) = self.started_at {
            job.started_at = *v;
        }
        if let Some(ref v) = self.completed_at {
            job.completed_at = *v;
        }
        if let Some(v) = self.attempts {
            job.attempts = v;
        }
        if let Some(ref v) = self.last_error {
            job.last_error = v.clone();
        }
        if let Some(ref v) = self.result {
            job.result = v.clone();
        }
        if let Some(ref v) = self.pid {
            job.pid = *v;
        }
        if let Some(ref v) = self.socket_path {
            job.socket_path = v.clone();
        }
        if let Some(ref v) = self.tcp_port {
            job.tcp_port = *v;
        }
        if let Some(ref v) = self.last_heartbeat {
            job.last_heartbeat = *v;
        }
        if let Some(ref v) = self.process_state {
            job.process_state = *v;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Selector for `get_all`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub name: Option<String>,
    pub external: Option<bool>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(ref name) = self.name {
            if job.name != *name {
                return false;
            }
        }
        if let Some(external) = self.external {
            if job.external != external {
                return false;
            }
        }
        true
    }
}

crate::builder! {
    pub struct JobBuilder => Job {
        into {
            name: String = "test-job",
        }
        set {
            id: JobId = JobId::new(),
            payload: Value = Value::Null,
            status: JobStatus = JobStatus::Pending,
            attempts: u32 = 0,
            max_attempts: u32 = 3,
            external: bool = false,
        }
        option {
            run_at: DateTime<Utc> = None,
            started_at: DateTime<Utc> = None,
            completed_at: DateTime<Utc> = None,
            last_error: String = None,
            result: Value = None,
            pid: u32 = None,
            socket_path: PathBuf = None,
            tcp_port: u16 = None,
            last_heartbeat: DateTime<Utc> = None,
            process_state: ProcessState = None,
        }
        computed {
            created_at: DateTime<Utc> = Utc::now(),
        }
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
