// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Managed long-lived process record and its spawn configuration.

use crate::id::ProcId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Status of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcStatus {
    Spawning,
    Running,
    Orphaned,
    Crashed,
    Stopped,
    Dead,
}

impl ProcStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcStatus::Stopped | ProcStatus::Dead)
    }
}

crate::simple_display! {
    ProcStatus {
        Spawning => "spawning",
        Running => "running",
        Orphaned => "orphaned",
        Crashed => "crashed",
        Stopped => "stopped",
        Dead => "dead",
    }
}

/// Restart behavior after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RestartPolicy {
    #[serde(rename = "never")]
    Never,
    #[default]
    #[serde(rename = "on-failure")]
    OnFailure,
    #[serde(rename = "always")]
    Always,
}

crate::simple_display! {
    RestartPolicy {
        Never => "never",
        OnFailure => "on-failure",
        Always => "always",
    }
}

/// Spawn configuration, snapshotted onto the record at registration time so
/// recovery after a parent restart does not depend on in-memory registries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Maximum silence before the watchdog kills the child.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Hard cap on uptime; `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_ms: Option<u64>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_kill_grace_ms() -> u64 {
    5_000
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_runtime_ms: None,
            restart: RestartPolicy::default(),
            max_consecutive_failures: default_max_consecutive_failures(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    pub fn max_runtime_ms(mut self, ms: u64) -> Self {
        self.max_runtime_ms = Some(ms);
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn max_consecutive_failures(mut self, n: u32) -> Self {
        self.max_consecutive_failures = n;
        self
    }

    pub fn kill_grace_ms(mut self, ms: u64) -> Self {
        self.kill_grace_ms = ms;
        self
    }
}

/// A long-lived supervised child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedProcess {
    pub id: ProcId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    pub status: ProcStatus,
    pub spec: ProcessSpec,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManagedProcess {
    pub fn new(name: impl Into<String>, spec: ProcessSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: ProcId::new(),
            name: name.into(),
            pid: None,
            socket_path: None,
            tcp_port: None,
            status: ProcStatus::Spawning,
            spec,
            created_at: now,
            started_at: None,
            stopped_at: None,
            last_heartbeat: None,
            restart_count: 0,
            consecutive_failures: 0,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Partial update for a managed process record. Same absent/null convention
/// as [`crate::JobUpdate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcUpdate {
    pub status: Option<ProcStatus>,
    pub pid: Option<Option<u32>>,
    pub socket_path: Option<Option<PathBuf>>,
    pub tcp_port: Option<Option<u16>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub stopped_at: Option<Option<DateTime<Utc>>>,
    pub last_heartbeat: Option<Option<DateTime<Utc>>>,
    pub restart_count: Option<u32>,
    pub consecutive_failures: Option<u32>,
    pub error: Option<Option<String>>,
}

impl ProcUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, v: ProcStatus) -> Self {
        self.status = Some(v);
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

    pub fn started_at(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(v);
        self
    }

    pub fn stopped_at(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.stopped_at = Some(v);
        self
    }

    pub fn last_heartbeat(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.last_heartbeat = Some(v);
        self
    }

    pub fn restart_count(mut self, v: u32) -> Self {
        self.restart_count = Some(v);
        self
    }

    pub fn consecutive_failures(mut self, v: u32) -> Self {
        self.consecutive_failures = Some(v);
        self
    }

    pub fn error(mut self, v: Option<String>) -> Self {
        self.error = Some(v);
        self
    }

    pub fn apply(&self, proc: &mut ManagedProcess) {
        if let Some(v) = self.status {
            proc.status = v;
        }
        if let Some(ref v) = self.pid {
            proc.pid = *v;
        }
        if let Some(ref v) = self.socket_path {
            proc.socket_path = v.clone();
        }
        if let Some(ref v) = self.tcp_port {
            proc.tcp_port = *v;
        }
        if let Some(ref v) = self.started_at {
            proc.started_at = *v;
        }
        if let Some(ref v) = self.stopped_at {
            proc.stopped_at = *v;
        }
        if let Some(ref v) = self.last_heartbeat {
            proc.last_heartbeat = *v;
        }
        if let Some(v) = self.restart_count {
            proc.restart_count = v;
        }
        if let Some(v) = self.consecutive_failures {
            proc.consecutive_failures = v;
        }
        if let Some(ref v) = self.error {
            proc.error = v.clone();
        }
    }
}

crate::builder! {
    pub struct ProcBuilder => ManagedProcess {
        into {
            name: String = "test-proc",
        }
        set {
            id: ProcId = ProcId::new(),
            status: ProcStatus = ProcStatus::Spawning,
            spec: ProcessSpec = ProcessSpec::new("sleep").args(["3600"]),
            restart_count: u32 = 0,
            consecutive_failures: u32 = 0,
        }
        option {
            pid: u32 = None,
            socket_path: PathBuf = None,
            tcp_port: u16 = None,
            started_at: DateTime<Utc> = None,
            stopped_at: DateTime<Utc> = None,
            last_heartbeat: DateTime<Utc> = None,
            error: String = None,
        }
        computed {
            created_at: DateTime<Utc> = Utc::now(),
        }
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
