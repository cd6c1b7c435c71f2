// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child process adapter.
//!
//! The engines never touch `tokio::process` directly; everything goes
//! through the [`Spawner`] trait so tests can stand in fake children that
//! speak the real socket protocol without forking.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("process has no pid (already reaped)")]
    NoPid,

    #[error("signal delivery failed: {0}")]
    Signal(String),
}

/// Everything needed to start one child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// One JSON line written to stdin before the pipe is closed.
    pub stdin_line: Option<String>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin_line: None,
        }
    }
}

/// Which signal to deliver on kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Term,
    Kill,
}

/// Handles to a started child.
pub struct SpawnedChild {
    pub pid: u32,
    /// stdout, line at a time.
    pub stdout: mpsc::UnboundedReceiver<String>,
    /// stderr, line at a time.
    pub stderr: mpsc::UnboundedReceiver<String>,
    /// Resolves with the exit code (`None` when killed by signal).
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// Child process operations used by the engines and the watchdog.
#[async_trait]
pub trait Spawner: Send + Sync + 'static {
    async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedChild, SpawnError>;

    /// Zero-signal liveness probe: permission errors count as alive,
    /// not-found counts as dead.
    fn is_alive(&self, pid: u32) -> bool;

    /// Deliver a signal. `Err` means the pid is already gone.
    fn kill(&self, pid: u32, signal: KillSignal) -> Result<(), SpawnError>;
}

/// Real OS implementation.
#[derive(Clone, Default)]
pub struct OsSpawner;

impl OsSpawner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Spawner for OsSpawner {
    async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedChild, SpawnError> {
        let mut command = tokio::process::Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin_line.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
            command: spec.command.clone(),
            source,
        })?;
        let pid = child.id().ok_or(SpawnError::NoPid)?;

        // Initial payload, then close stdin so the child sees EOF.
        if let Some(line) = spec.stdin_line {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(line.as_bytes()).await;
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.shutdown().await;
            }
        }

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(stream_lines(stdout, stdout_tx));
        }
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(stream_lines(stderr, stderr_tx));
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedChild {
            pid,
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
        })
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            // No permission to signal it, but it exists.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32, signal: KillSignal) -> Result<(), SpawnError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let signal = match signal {
            KillSignal::Term => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        };
        kill(Pid::from_raw(pid as i32), signal).map_err(|e| SpawnError::Signal(e.to_string()))
    }

    #[cfg(not(unix))]
    fn kill(&self, _pid: u32, _signal: KillSignal) -> Result<(), SpawnError> {
        Err(SpawnError::Signal("signals unsupported on this platform".into()))
    }
}

async fn stream_lines(
    reader: impl tokio::io::AsyncRead + Unpin,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}
