// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor for registered long-lived processes.
//!
//! Unlike jobs, managed processes are expected to stay up: the supervisor
//! tracks their health over the socket protocol, restarts them per policy
//! with failure accounting, and marks them `dead` when they crash too many
//! times in a row.

use crate::error::EngineError;
use crate::kill;
use crate::router::{new_frame_txs, FrameRouter, FrameTxs};
use crate::spawner::{SpawnSpec, Spawner};
use dl_core::{
    queue_backoff, Clock, EventBus, ManagedProcess, ProcId, ProcStatus, ProcUpdate, ProcessSpec,
    RestartPolicy, SystemClock,
};
use dl_ipc::{Broker, ChildEnv, Endpoint, Frame, FrameBody, FrameIdent, SocketKind};
use dl_storage::ProcessStore;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Restart backoff bounds (doubling per consecutive failure).
const RESTART_BACKOFF_BASE_MS: u64 = 1_000;
const RESTART_BACKOFF_MAX_MS: u64 = 60_000;

/// The process supervisor. Cheap to clone; all state is shared.
pub struct Supervisor<C: Clock = SystemClock> {
    inner: Arc<SupInner<C>>,
}

impl<C: Clock> Clone for Supervisor<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct SupInner<C: Clock> {
    store: Arc<dyn ProcessStore>,
    events: EventBus,
    broker: Arc<Broker>,
    spawner: Arc<dyn Spawner>,
    clock: C,
    specs: Mutex<HashMap<String, ProcessSpec>>,
    frame_txs: FrameTxs,
    /// Ids with an intentional stop in flight; their exit is not a crash.
    stopping: Mutex<HashSet<String>>,
}

impl Supervisor<SystemClock> {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        events: EventBus,
        broker: Arc<Broker>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self::with_clock(store, events, broker, spawner, SystemClock)
    }
}

impl<C: Clock> Supervisor<C> {
    pub fn with_clock(
        store: Arc<dyn ProcessStore>,
        events: EventBus,
        broker: Arc<Broker>,
        spawner: Arc<dyn Spawner>,
        clock: C,
    ) -> Self {
        let frame_txs = new_frame_txs();
        broker.set_handler(
            SocketKind::Proc,
            Arc::new(FrameRouter::new(Arc::clone(&frame_txs))),
        );
        Self {
            inner: Arc::new(SupInner {
                store,
                events,
                broker,
                spawner,
                clock,
                specs: Mutex::new(HashMap::new()),
                frame_txs,
                stopping: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register a named process configuration.
    pub fn register(&self, name: &str, spec: ProcessSpec) -> Result<(), EngineError> {
        let mut specs = self.inner.specs.lock();
        if specs.contains_key(name) {
            return Err(EngineError::AlreadyRegistered(name.to_string()));
        }
        specs.insert(name.to_string(), spec);
        Ok(())
    }

    /// Create the record and spawn the child.
    pub async fn spawn(
        &self,
        name: &str,
        metadata: Option<Value>,
    ) -> Result<ProcId, EngineError> {
        let spec = self
            .inner
            .specs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandler(name.to_string()))?;

        let proc = ManagedProcess::new(name, spec, self.inner.clock.now_utc());
        self.inner.store.create(&proc).await?;

        self.inner.spawn_attempt(&proc, metadata).await?;
        Ok(proc.id)
    }

    /// Stop a process intentionally (graceful escalation).
    pub async fn stop(&self, id: &str, grace_ms: Option<u64>) -> Result<bool, EngineError> {
        let Some(proc) = self.inner.store.get(id).await? else {
            return Ok(false);
        };
        if proc.is_terminal() {
            return Ok(false);
        }

        self.inner.stopping.lock().insert(id.to_string());
        if let Some(pid) = proc.pid {
            kill::escalate(
                &*self.inner.spawner,
                pid,
                grace_ms.unwrap_or(proc.spec.kill_grace_ms),
            )
            .await;
        }
        self.inner.finalize_stopped(&proc).await;
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ManagedProcess>, EngineError> {
        Ok(self.inner.store.get(id).await?)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Vec<ManagedProcess>, EngineError> {
        Ok(self.inner.store.get_by_name(name).await?)
    }

    pub async fn list(&self) -> Result<Vec<ManagedProcess>, EngineError> {
        Ok(self.inner.store.get_all().await?)
    }

    /// Reconnect running processes after a parent restart; crash-path the
    /// ones whose pid is gone.
    pub async fn recover(&self) {
        let running = match self.inner.store.get_running().await {
            Ok(procs) => procs,
            Err(e) => {
                warn!(error = %e, "process recovery scan failed");
                return;
            }
        };

        let mut keep: HashSet<String> = HashSet::new();
        for proc in running {
            let alive = proc.pid.is_some_and(|pid| self.inner.spawner.is_alive(pid));
            let endpoint = stored_endpoint(&proc);

            match (alive, endpoint) {
                (true, Some(endpoint)) => {
                    if let Err(e) = self
                        .inner
                        .broker
                        .reconnect(SocketKind::Proc, proc.id.as_str(), endpoint)
                        .await
                    {
                        warn!(proc_id = %proc.id, error = %e, "reconnect failed, marking orphaned");
                        let _ = self
                            .inner
                            .store
                            .update(
                                proc.id.as_str(),
                                ProcUpdate::new().status(ProcStatus::Orphaned),
                            )
                            .await;
                        continue;
                    }
                    self.inner.attach_frame_processor(proc.id.as_str());
                    keep.insert(proc.id.to_string());
                    let _ = self
                        .inner
                        .store
                        .update(
                            proc.id.as_str(),
                            ProcUpdate::new()
                                .last_heartbeat(Some(self.inner.clock.now_utc())),
                        )
                        .await;
                    info!(proc_id = %proc.id, "managed process reconnected");
                    self.inner
                        .events
                        .publish("process.reconnected", json!({ "processId": proc.id.as_str() }));
                }
                _ => {
                    info!(proc_id = %proc.id, "process died while parent was down");
                    self.inner.handle_crash(&proc, None, "process died while parent was down")
                        .await;
                }
            }
        }

        self.inner.broker.clean_orphaned_sockets(&keep);
    }

    /// Watchdog entry point. `reason` is `"heartbeat"` or `"runtime"`.
    pub async fn kill_stale(&self, proc: &ManagedProcess, reason: &str) {
        let payload = json!({ "processId": proc.id.as_str() });
        self.inner
            .events
            .publish("process.watchdog.stale", payload.clone());

        if let Some(pid) = proc.pid {
            kill::escalate(&*self.inner.spawner, pid, proc.spec.kill_grace_ms).await;
        }

        let error = match reason {
            "runtime" => "Max runtime exceeded",
            _ => "Heartbeat timeout",
        };
        self.inner.cleanup_child(proc.id.as_str());
        let _ = self
            .inner
            .store
            .update(
                proc.id.as_str(),
                ProcUpdate::new()
                    .status(ProcStatus::Crashed)
                    .error(Some(error.to_string())),
            )
            .await;
        self.inner.events.publish(
            "process.watchdog.killed",
            json!({ "processId": proc.id.as_str(), "reason": reason }),
        );
    }

    /// Shut everything down: SIGTERM all running children, release sockets,
    /// stop the store.
    pub async fn shutdown(&self) {
        if let Ok(running) = self.inner.store.get_running().await {
            for proc in running {
                self.inner.stopping.lock().insert(proc.id.to_string());
                if let Some(pid) = proc.pid {
                    let _ = self
                        .inner
                        .spawner
                        .kill(pid, crate::spawner::KillSignal::Term);
                }
                self.inner.cleanup_child(proc.id.as_str());
            }
        }
        self.inner.store.stop().await;
        info!("process supervisor stopped");
    }
}

impl<C: Clock> SupInner<C> {
    /// One spawn of the child behind a record. Shared by initial spawn,
    /// restart, and crash recovery.
    fn spawn_attempt<'a>(
        self: &'a Arc<Self>,
        proc: &'a ManagedProcess,
        metadata: Option<Value>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>> {
        Box::pin(self.spawn_attempt_inner(proc, metadata))
    }

    async fn spawn_attempt_inner(
        self: &Arc<Self>,
        proc: &ManagedProcess,
        metadata: Option<Value>,
    ) -> Result<(), EngineError> {
        let id = proc.id.to_string();
        let spec = proc.spec.clone();

        let endpoint = self.broker.create_socket(SocketKind::Proc, &id).await?;
        let _ = self
            .store
            .update(
                &id,
                ProcUpdate::new()
                    .status(ProcStatus::Spawning)
                    .socket_path(endpoint.unix_path().map(Into::into))
                    .tcp_port(endpoint.tcp_port())
                    .last_heartbeat(Some(self.clock.now_utc())),
            )
            .await;

        let child_env = ChildEnv {
            ident: FrameIdent::process(id.clone()),
            endpoint,
            metadata,
            job_name: None,
        };
        let mut env = child_env.to_env();
        env.extend(spec.env.iter().cloned());

        let child = match self
            .spawner
            .spawn(SpawnSpec {
                command: spec.command.clone(),
                args: spec.args.clone(),
                env,
                cwd: spec.cwd.clone(),
                stdin_line: None,
            })
            .await
        {
            Ok(child) => child,
            Err(e) => {
                self.cleanup_child(&id);
                self.handle_crash(proc, None, &e.to_string()).await;
                return Ok(());
            }
        };

        let pid = child.pid;
        let _ = self
            .store
            .update(&id, ProcUpdate::new().pid(Some(pid)))
            .await;
        info!(proc_id = %id, name = %proc.name, pid, "process spawned");

        self.attach_frame_processor(&id);
        self.stream_child_output(&id, child.stdout, "stdout");
        self.stream_child_output(&id, child.stderr, "stderr");

        let inner = Arc::clone(self);
        let exit_proc = proc.clone();
        tokio::spawn(async move {
            let code = child.exit.await.ok().flatten();
            inner.handle_exit(&exit_proc, code).await;
        });
        Ok(())
    }

    async fn handle_exit(self: &Arc<Self>, proc: &ManagedProcess, code: Option<i32>) {
        let id = proc.id.as_str();

        // Reload: the record carries the current failure accounting.
        let Ok(Some(current)) = self.store.get(id).await else {
            return;
        };
        if current.is_terminal() {
            return;
        }

        if self.stopping.lock().remove(id) {
            self.finalize_stopped(&current).await;
            return;
        }

        // Clean exit under on-failure does not count as a crash.
        if code == Some(0) && current.spec.restart == RestartPolicy::OnFailure {
            self.finalize_stopped(&current).await;
            return;
        }

        let error = match code {
            Some(code) => format!("Process exited with code {code}"),
            None => "Process killed by signal".to_string(),
        };
        self.handle_crash(&current, code, &error).await;
    }

    /// Crash accounting and the restart decision.
    async fn handle_crash(self: &Arc<Self>, proc: &ManagedProcess, code: Option<i32>, error: &str) {
        let id = proc.id.to_string();
        self.cleanup_child(&id);

        let failures = proc.consecutive_failures + 1;
        let now = self.clock.now_utc();

        let restartable = proc.spec.restart != RestartPolicy::Never;
        if restartable && failures >= proc.spec.max_consecutive_failures {
            let _ = self
                .store
                .update(
                    &id,
                    ProcUpdate::new()
                        .status(ProcStatus::Dead)
                        .consecutive_failures(failures)
                        .stopped_at(Some(now))
                        .error(Some(error.to_string())),
                )
                .await;
            warn!(proc_id = %id, failures, "process dead, giving up");
            self.events
                .publish("process.dead", json!({ "processId": id, "failures": failures }));
            return;
        }

        let _ = self
            .store
            .update(
                &id,
                ProcUpdate::new()
                    .status(ProcStatus::Crashed)
                    .consecutive_failures(failures)
                    .pid(None)
                    .error(Some(error.to_string())),
            )
            .await;
        self.events.publish(
            "process.crashed",
            json!({ "processId": id, "code": code, "error": error }),
        );

        if !restartable {
            let _ = self
                .store
                .update(&id, ProcUpdate::new().stopped_at(Some(now)))
                .await;
            return;
        }

        // Respawn after a doubling backoff.
        let delay = queue_backoff(RESTART_BACKOFF_BASE_MS, RESTART_BACKOFF_MAX_MS, failures);
        debug!(proc_id = %id, failures, delay_ms = delay.as_millis() as u64, "restart scheduled");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Ok(Some(current)) = inner.store.get(&id).await else {
                return;
            };
            // The process may have been stopped or killed for good while
            // the backoff ran.
            if current.status != ProcStatus::Crashed {
                return;
            }
            let _ = inner
                .store
                .update(
                    &id,
                    ProcUpdate::new().restart_count(current.restart_count + 1),
                )
                .await;
            if let Ok(Some(refreshed)) = inner.store.get(&id).await {
                let _ = inner.spawn_attempt(&refreshed, None).await;
            }
        });
    }

    async fn finalize_stopped(&self, proc: &ManagedProcess) {
        self.cleanup_child(proc.id.as_str());
        let _ = self
            .store
            .update(
                proc.id.as_str(),
                ProcUpdate::new()
                    .status(ProcStatus::Stopped)
                    .stopped_at(Some(self.clock.now_utc())),
            )
            .await;
        self.events
            .publish("process.stopped", json!({ "processId": proc.id.as_str() }));
        info!(proc_id = %proc.id, "process stopped");
    }

    fn attach_frame_processor(self: &Arc<Self>, id: &str) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        self.frame_txs.lock().insert(id.to_string(), tx);
        let inner = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                inner.handle_frame(&id, frame).await;
            }
        });
    }

    async fn handle_frame(self: &Arc<Self>, id: &str, frame: Frame) {
        let now = self.clock.now_utc();

        match frame.body {
            FrameBody::Connected | FrameBody::Started => {
                let _ = self
                    .store
                    .update(
                        id,
                        ProcUpdate::new()
                            .status(ProcStatus::Running)
                            .started_at(Some(now))
                            .last_heartbeat(Some(now)),
                    )
                    .await;
                if let Ok(Some(proc)) = self.store.get(id).await {
                    self.events.publish(
                        "process.started",
                        json!({ "processId": id, "name": proc.name, "pid": proc.pid }),
                    );
                }
            }
            FrameBody::Heartbeat | FrameBody::Progress { .. } => {
                // Any sign of life resets the failure streak.
                let _ = self
                    .store
                    .update(
                        id,
                        ProcUpdate::new()
                            .last_heartbeat(Some(now))
                            .consecutive_failures(0),
                    )
                    .await;
            }
            FrameBody::Log { level, message, data } => {
                let _ = self
                    .store
                    .update(id, ProcUpdate::new().last_heartbeat(Some(now)))
                    .await;
                self.events.publish(
                    "process.log",
                    json!({ "processId": id, "level": level, "message": message, "data": data }),
                );
            }
            FrameBody::Stats { cpu, memory, uptime } => {
                let _ = self
                    .store
                    .update(id, ProcUpdate::new().last_heartbeat(Some(now)))
                    .await;
                self.events.publish(
                    "process.stats",
                    json!({ "processId": id, "cpu": cpu, "memory": memory, "uptime": uptime }),
                );
            }
            FrameBody::Failed { error, .. } => {
                // The exit watcher owns the status transition; keep the
                // child's own account of why.
                let _ = self
                    .store
                    .update(id, ProcUpdate::new().error(Some(error)))
                    .await;
            }
            FrameBody::Disconnecting | FrameBody::Completed { .. } => {
                debug!(proc_id = id, "child announced shutdown");
            }
            other => debug!(proc_id = id, frame = ?other, "unexpected frame kind ignored"),
        }
    }

    fn stream_child_output(
        self: &Arc<Self>,
        id: &str,
        mut lines: mpsc::UnboundedReceiver<String>,
        stream: &'static str,
    ) {
        let events = self.events.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                events.publish(
                    "process.output",
                    json!({ "processId": id, "stream": stream, "line": line }),
                );
            }
        });
    }

    fn cleanup_child(&self, id: &str) {
        self.frame_txs.lock().remove(id);
        self.broker.close_socket(SocketKind::Proc, id);
        self.broker.release(SocketKind::Proc, id);
    }
}

fn stored_endpoint(proc: &ManagedProcess) -> Option<Endpoint> {
    if let Some(ref path) = proc.socket_path {
        return Some(Endpoint::Unix(path.clone()));
    }
    proc.tcp_port.map(Endpoint::Tcp)
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
