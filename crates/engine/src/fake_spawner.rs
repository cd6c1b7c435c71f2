// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake child processes for tests.
//!
//! The fake hands each "spawned" child to a test-provided callback, which
//! can connect a real [`dl_ipc::ChildClient`] against the endpoint in the
//! spec's environment and drive the protocol in-process. Liveness and
//! signals are scripted.

use crate::spawner::{KillSignal, SpawnError, SpawnSpec, SpawnedChild, Spawner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// The write side of a fake child, handed to the test callback.
pub struct FakeChild {
    pub pid: u32,
    pub spec: SpawnSpec,
    pub stdout: mpsc::UnboundedSender<String>,
    pub stderr: mpsc::UnboundedSender<String>,
    /// Send the exit code to "terminate" the child.
    pub exit: oneshot::Sender<Option<i32>>,
}

impl FakeChild {
    /// Value of an environment variable in the spawn spec.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.spec
            .env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

type SpawnCallback = dyn Fn(FakeChild) + Send + Sync;

/// Scriptable [`Spawner`].
#[derive(Clone)]
pub struct FakeSpawner {
    inner: Arc<FakeInner>,
}

struct FakeInner {
    next_pid: AtomicU32,
    on_spawn: Mutex<Option<Arc<SpawnCallback>>>,
    alive: Mutex<HashMap<u32, bool>>,
    ignores_term: Mutex<std::collections::HashSet<u32>>,
    kills: Mutex<Vec<(u32, KillSignal)>>,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FakeInner {
                next_pid: AtomicU32::new(40_000),
                on_spawn: Mutex::new(None),
                alive: Mutex::new(HashMap::new()),
                ignores_term: Mutex::new(std::collections::HashSet::new()),
                kills: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Install the callback invoked for every spawn.
    pub fn on_spawn<F>(&self, callback: F)
    where
        F: Fn(FakeChild) + Send + Sync + 'static,
    {
        *self.inner.on_spawn.lock() = Some(Arc::new(callback));
    }

    /// Script the liveness of an arbitrary pid (e.g. one read back from a
    /// persisted record in a recovery test).
    pub fn set_alive(&self, pid: u32, alive: bool) {
        self.inner.alive.lock().insert(pid, alive);
    }

    /// Script a pid that stays alive through SIGTERM (only SIGKILL takes).
    pub fn set_ignores_term(&self, pid: u32) {
        self.inner.ignores_term.lock().insert(pid);
    }

    /// Signals delivered so far, in order.
    pub fn kills(&self) -> Vec<(u32, KillSignal)> {
        self.inner.kills.lock().clone()
    }

    /// All specs seen would be overkill; tests usually only need the count.
    pub fn spawn_count(&self) -> u32 {
        self.inner.next_pid.load(Ordering::SeqCst) - 40_000
    }
}

#[async_trait]
impl Spawner for FakeSpawner {
    async fn spawn(&self, spec: SpawnSpec) -> Result<SpawnedChild, SpawnError> {
        let pid = self.inner.next_pid.fetch_add(1, Ordering::SeqCst);
        self.inner.alive.lock().insert(pid, true);

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let callback = self.inner.on_spawn.lock().clone();
        if let Some(callback) = callback {
            callback(FakeChild {
                pid,
                spec,
                stdout: stdout_tx,
                stderr: stderr_tx,
                exit: exit_tx,
            });
        } else {
            // No script: the child "runs" until killed; dropping exit_tx
            // here would look like an immediate crash.
            std::mem::forget(exit_tx);
        }

        Ok(SpawnedChild {
            pid,
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.inner.alive.lock().get(&pid).copied().unwrap_or(false)
    }

    fn kill(&self, pid: u32, signal: KillSignal) -> Result<(), SpawnError> {
        let alive = self.is_alive(pid);
        self.inner.kills.lock().push((pid, signal));
        if !alive {
            return Err(SpawnError::Signal(format!("pid {pid} not found")));
        }
        if signal == KillSignal::Term && self.inner.ignores_term.lock().contains(&pid) {
            return Ok(());
        }
        self.inner.alive.lock().insert(pid, false);
        Ok(())
    }
}
