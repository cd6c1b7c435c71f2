// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background job engine.
//!
//! Enqueue/schedule, the claim-based tick loop, backoff retry, and dispatch
//! to in-process handlers or externally spawned (any-language) workers
//! speaking the socket protocol.

use crate::error::EngineError;
use crate::kill;
use crate::router::{new_frame_txs, FrameRouter, FrameTxs};
use crate::spawner::{SpawnSpec, Spawner};
use chrono::Duration as ChronoDuration;
use dl_core::{
    queue_backoff, Clock, EventBus, Job, JobFilter, JobId, JobStatus, JobUpdate, ProcessState,
    SystemClock,
};
use dl_ipc::{Broker, ChildEnv, Endpoint, Frame, FrameBody, FrameIdent, LogLevel, SocketKind};
use dl_storage::JobStore;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error returned by a job handler. Carries only a message; the engine owns
/// retry policy and persistence.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// An in-process job handler.
pub trait JobHandler: Send + Sync {
    fn run(&self, ctx: JobContext) -> HandlerFuture;
}

/// Blanket adapter so plain async closures register directly.
struct FnHandler<F>(F);

impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn run(&self, ctx: JobContext) -> HandlerFuture {
        Box::pin((self.0)(ctx))
    }
}

/// Execution context handed to in-process handlers.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub name: String,
    pub payload: Value,
    events: EventBus,
}

impl JobContext {
    /// Publish an application event on `job.event`, `job.<name>.event`,
    /// and `job.<id>.event`.
    pub fn emit(&self, payload: Value) {
        self.events.publish("job.event", payload.clone());
        self.events
            .publish(&format!("job.{}.event", self.name), payload.clone());
        self.events
            .publish(&format!("job.{}.event", self.job_id), payload);
    }

    /// Structured log line attributed to this job.
    pub fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(job_id = %self.job_id, job = %self.name, "{message}"),
            LogLevel::Info => info!(job_id = %self.job_id, job = %self.name, "{message}"),
            LogLevel::Warn => warn!(job_id = %self.job_id, job = %self.name, "{message}"),
            LogLevel::Error => {
                tracing::error!(job_id = %self.job_id, job = %self.name, "{message}")
            }
        }
        self.events.publish(
            "job.log",
            json!({
                "jobId": self.job_id.as_str(),
                "level": level,
                "message": message,
            }),
        );
    }
}

/// Spawn configuration for an externally executed job handler.
#[derive(Debug, Clone)]
pub struct ExternalJobConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<std::path::PathBuf>,
    /// Override of the engine-wide heartbeat timeout.
    pub heartbeat_timeout_ms: Option<u64>,
    pub kill_grace_ms: Option<u64>,
    /// Hard wall-clock cap per attempt.
    pub timeout_ms: Option<u64>,
    /// Opaque map exported as `DONKEYLABS_METADATA`.
    pub metadata: Option<Value>,
}

impl ExternalJobConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            heartbeat_timeout_ms: None,
            kill_grace_ms: None,
            timeout_ms: None,
            metadata: None,
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

    pub fn cwd(mut self, cwd: impl Into<std::path::PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = Some(ms);
        self
    }

    pub fn kill_grace_ms(mut self, ms: u64) -> Self {
        self.kill_grace_ms = Some(ms);
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub poll_interval: Duration,
    pub concurrency: usize,
    /// When false, failed attempts requeue immediately as `pending`.
    pub retry_backoff: bool,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub kill_grace_ms: u64,
    /// How long `stop()` waits for active in-process jobs.
    pub drain_timeout: Duration,
    pub default_max_attempts: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            concurrency: 5,
            retry_backoff: true,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            heartbeat_timeout_ms: 30_000,
            kill_grace_ms: 5_000,
            drain_timeout: Duration::from_secs(30),
            default_max_attempts: 3,
        }
    }
}

impl JobsConfig {
    /// Defaults with `DONKEYLABS_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(interval) = crate::env::poll_interval() {
            config.poll_interval = interval;
        }
        config
    }
}

/// Per-name watchdog policy for an external job.
#[derive(Debug, Clone, Copy)]
pub struct ExternalKillPolicy {
    pub heartbeat_timeout_ms: u64,
    pub kill_grace_ms: u64,
    pub timeout_ms: Option<u64>,
}

enum Registered {
    InProc(Arc<dyn JobHandler>),
    External(ExternalJobConfig),
}

/// Options accepted by `enqueue`/`schedule`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    pub max_attempts: Option<u32>,
}

/// The jobs engine. Cheap to clone; all state is shared.
pub struct Jobs<C: Clock = SystemClock> {
    inner: Arc<JobsInner<C>>,
}

impl<C: Clock> Clone for Jobs<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct JobsInner<C: Clock> {
    store: Arc<dyn JobStore>,
    events: EventBus,
    broker: Arc<Broker>,
    spawner: Arc<dyn Spawner>,
    clock: C,
    config: JobsConfig,
    handlers: Mutex<HashMap<String, Registered>>,
    /// Jobs currently holding a concurrency slot; value marks external.
    active: Mutex<HashMap<String, bool>>,
    ticking: AtomicBool,
    cancel: CancellationToken,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    frame_txs: FrameTxs,
}

impl Jobs<SystemClock> {
    pub fn new(
        store: Arc<dyn JobStore>,
        events: EventBus,
        broker: Arc<Broker>,
        spawner: Arc<dyn Spawner>,
        config: JobsConfig,
    ) -> Self {
        Self::with_clock(store, events, broker, spawner, config, SystemClock)
    }
}

impl<C: Clock> Jobs<C> {
    pub fn with_clock(
        store: Arc<dyn JobStore>,
        events: EventBus,
        broker: Arc<Broker>,
        spawner: Arc<dyn Spawner>,
        config: JobsConfig,
        clock: C,
    ) -> Self {
        let frame_txs = new_frame_txs();
        broker.set_handler(
            SocketKind::Job,
            Arc::new(FrameRouter::new(Arc::clone(&frame_txs))),
        );
        Self {
            inner: Arc::new(JobsInner {
                store,
                events,
                broker,
                spawner,
                clock,
                config,
                handlers: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                ticking: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tick_task: Mutex::new(None),
                frame_txs,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    // -- registration -------------------------------------------------------

    pub fn register(&self, name: &str, handler: Arc<dyn JobHandler>) -> Result<(), EngineError> {
        self.insert_handler(name, Registered::InProc(handler))
    }

    /// Register an async closure as an in-process handler.
    pub fn register_fn<F, Fut>(&self, name: &str, handler: F) -> Result<(), EngineError>
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(handler)))
    }

    pub fn register_external(
        &self,
        name: &str,
        config: ExternalJobConfig,
    ) -> Result<(), EngineError> {
        self.insert_handler(name, Registered::External(config))
    }

    fn insert_handler(&self, name: &str, registered: Registered) -> Result<(), EngineError> {
        let mut handlers = self.inner.handlers.lock();
        if handlers.contains_key(name) {
            return Err(EngineError::AlreadyRegistered(name.to_string()));
        }
        handlers.insert(name.to_string(), registered);
        Ok(())
    }

    fn is_external(&self, name: &str) -> Option<bool> {
        self.inner
            .handlers
            .lock()
            .get(name)
            .map(|r| matches!(r, Registered::External(_)))
    }

    /// Watchdog policy for a registered external job name.
    pub fn kill_policy(&self, name: &str) -> ExternalKillPolicy {
        let handlers = self.inner.handlers.lock();
        let config = match handlers.get(name) {
            Some(Registered::External(config)) => Some(config),
            _ => None,
        };
        ExternalKillPolicy {
            heartbeat_timeout_ms: config
                .and_then(|c| c.heartbeat_timeout_ms)
                .unwrap_or(self.inner.config.heartbeat_timeout_ms),
            kill_grace_ms: config
                .and_then(|c| c.kill_grace_ms)
                .unwrap_or(self.inner.config.kill_grace_ms),
            timeout_ms: config.and_then(|c| c.timeout_ms),
        }
    }

    // -- producers ----------------------------------------------------------

    /// Write a new pending job. Fails when the name is not registered.
    pub async fn enqueue(
        &self,
        name: &str,
        data: Value,
        opts: EnqueueOpts,
    ) -> Result<JobId, EngineError> {
        self.create_job(name, data, None, opts).await
    }

    /// Write a new job scheduled for a future run time.
    pub async fn schedule(
        &self,
        name: &str,
        data: Value,
        run_at: chrono::DateTime<chrono::Utc>,
        opts: EnqueueOpts,
    ) -> Result<JobId, EngineError> {
        self.create_job(name, data, Some(run_at), opts).await
    }

    async fn create_job(
        &self,
        name: &str,
        data: Value,
        run_at: Option<chrono::DateTime<chrono::Utc>>,
        opts: EnqueueOpts,
    ) -> Result<JobId, EngineError> {
        let external = self
            .is_external(name)
            .ok_or_else(|| EngineError::UnknownHandler(name.to_string()))?;

        let now = self.inner.clock.now_utc();
        let mut job = Job::new(
            name,
            data,
            opts.max_attempts
                .unwrap_or(self.inner.config.default_max_attempts),
            now,
        );
        job.external = external;
        if external {
            job.process_state = Some(ProcessState::Spawning);
        }
        if let Some(run_at) = run_at {
            job.status = JobStatus::Scheduled;
            job.run_at = Some(run_at);
        }

        self.inner.store.create(&job).await?;
        debug!(job_id = %job.id, name, external, scheduled = run_at.is_some(), "job enqueued");
        Ok(job.id)
    }

    // -- queries ------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<Option<Job>, EngineError> {
        Ok(self.inner.store.get(id).await?)
    }

    pub async fn get_by_name(
        &self,
        name: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, EngineError> {
        Ok(self.inner.store.get_by_name(name, status).await?)
    }

    pub async fn get_all(&self, filter: JobFilter) -> Result<Vec<Job>, EngineError> {
        Ok(self.inner.store.get_all(filter).await?)
    }

    pub async fn get_running_external(&self) -> Result<Vec<Job>, EngineError> {
        Ok(self.inner.store.get_running_external().await?)
    }

    // -- cancellation -------------------------------------------------------

    /// Cancel a job. Pending/scheduled jobs are deleted; running external
    /// jobs get SIGTERM and cleanup. Running in-process jobs cannot be
    /// cancelled (returns false).
    pub async fn cancel(&self, id: &str) -> Result<bool, EngineError> {
        let Some(job) = self.inner.store.get(id).await? else {
            return Ok(false);
        };

        match job.status {
            JobStatus::Pending | JobStatus::Scheduled => {
                let existed = self.inner.store.delete(id).await?;
                if existed {
                    self.inner
                        .events
                        .publish("job.cancelled", json!({ "jobId": id }));
                }
                Ok(existed)
            }
            JobStatus::Running if job.external => {
                let Some(pid) = job.pid else { return Ok(false) };
                if !self.inner.take_active(id) {
                    return Ok(false);
                }
                kill::escalate(
                    &*self.inner.spawner,
                    pid,
                    self.kill_policy(&job.name).kill_grace_ms,
                )
                .await;
                self.inner
                    .finalize_failed_terminal(&job, "Cancelled", Some(ProcessState::Orphaned))
                    .await;
                self.inner
                    .events
                    .publish("job.cancelled", json!({ "jobId": id }));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Recover external jobs from a previous run, then start the tick loop.
    pub async fn start(&self) {
        self.recover().await;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => inner.tick().await,
                    _ = inner.cancel.cancelled() => break,
                }
            }
        });
        *self.inner.tick_task.lock() = Some(task);
        info!("jobs engine started");
    }

    /// Stop the tick loop, drain in-process jobs, SIGTERM external
    /// children, and release socket resources.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.tick_task.lock().take() {
            task.abort();
        }

        // Drain in-process work.
        let deadline = self.inner.clock.now() + self.inner.config.drain_timeout;
        loop {
            let inproc_active = self
                .inner
                .active
                .lock()
                .values()
                .any(|external| !external);
            if !inproc_active || self.inner.clock.now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // SIGTERM external children and release their sockets.
        if let Ok(running) = self.inner.store.get_running_external().await {
            for job in running {
                if let Some(pid) = job.pid {
                    let _ = self.inner.spawner.kill(pid, crate::spawner::KillSignal::Term);
                }
                self.inner.cleanup_child(job.id.as_str());
            }
        }

        self.inner.store.stop().await;
        info!("jobs engine stopped");
    }

    /// One tick, callable directly in tests.
    pub async fn tick_now(&self) {
        self.inner.tick().await;
    }

    /// Reconnect-on-parent-start: every external job left `running` is
    /// probed; live children get their listener rebound, dead ones are
    /// terminalized. In-process jobs stranded `running` have nothing to
    /// reconnect to and are failed outright.
    pub async fn recover(&self) {
        let running = match self.inner.store.get_by_status(JobStatus::Running).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "recovery scan failed");
                return;
            }
        };

        let mut keep: HashSet<String> = HashSet::new();
        for job in &running {
            if !job.external {
                warn!(job_id = %job.id, "in-process job stranded at restart, failing");
                self.inner
                    .finalize_failed_terminal(job, "parent restarted during execution", None)
                    .await;
                continue;
            }

            let endpoint = stored_endpoint(job);
            let alive = job.pid.is_some_and(|pid| self.inner.spawner.is_alive(pid));

            match (alive, endpoint) {
                (true, Some(endpoint)) => {
                    if let Err(e) = self
                        .inner
                        .broker
                        .reconnect(SocketKind::Job, job.id.as_str(), endpoint)
                        .await
                    {
                        // ReconnectFailed: mark orphaned; the watchdog
                        // terminates it on a later pass.
                        warn!(job_id = %job.id, error = %e, "reconnect failed, marking orphaned");
                        let _ = self
                            .inner
                            .store
                            .update(
                                job.id.as_str(),
                                JobUpdate::new().process_state(Some(ProcessState::Orphaned)),
                            )
                            .await;
                        continue;
                    }
                    self.inner.attach_frame_processor(job.id.as_str());
                    self.inner.active.lock().insert(job.id.to_string(), true);
                    keep.insert(job.id.to_string());
                    let _ = self
                        .inner
                        .store
                        .update(
                            job.id.as_str(),
                            JobUpdate::new()
                                .process_state(Some(ProcessState::Running))
                                .last_heartbeat(Some(self.inner.clock.now_utc())),
                        )
                        .await;
                    info!(job_id = %job.id, "external job reconnected");
                    self.inner
                        .events
                        .publish("job.reconnected", json!({ "jobId": job.id.as_str() }));
                }
                _ => {
                    self.inner
                        .finalize_failed_terminal(
                            job,
                            "process died while parent was down",
                            Some(ProcessState::Orphaned),
                        )
                        .await;
                    self.inner.broker.release(SocketKind::Job, job.id.as_str());
                }
            }
        }

        self.inner.broker.clean_orphaned_sockets(&keep);
    }

    /// Watchdog entry point: kill a stale or over-deadline external job.
    /// `reason` is `"heartbeat"` or `"timeout"`.
    pub async fn kill_stale(&self, job: &Job, reason: &str) {
        // The record may not be tracked locally (leftover from a crashed
        // parent); terminalize it regardless.
        self.inner.take_active(job.id.as_str());
        let payload = json!({ "jobId": job.id.as_str() });
        if reason == "heartbeat" {
            self.inner.events.publish("job.stale", payload.clone());
        }
        self.inner
            .events
            .publish("job.watchdog.stale", payload.clone());

        if let Some(pid) = job.pid {
            kill::escalate(
                &*self.inner.spawner,
                pid,
                self.kill_policy(&job.name).kill_grace_ms,
            )
            .await;
        }

        let error = match reason {
            "timeout" => "Job exceeded its timeout".to_string(),
            _ => "Heartbeat timeout".to_string(),
        };
        self.inner
            .finalize_failed_terminal(job, &error, Some(ProcessState::Orphaned))
            .await;
        self.inner.events.publish(
            "job.watchdog.killed",
            json!({ "jobId": job.id.as_str(), "reason": reason }),
        );
    }
}

impl<C: Clock> JobsInner<C> {
    /// One pass of the tick loop. Guarded against overlap.
    async fn tick(self: &Arc<Self>) {
        if self.ticking.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tick_inner().await;
        self.ticking.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(self: &Arc<Self>) {
        let now = self.clock.now_utc();

        // 1. Promote ready scheduled jobs.
        match self.store.get_scheduled_ready(now).await {
            Ok(ready) => {
                for job in ready {
                    let _ = self
                        .store
                        .update(
                            job.id.as_str(),
                            JobUpdate::new().status(JobStatus::Pending).run_at(None),
                        )
                        .await;
                }
            }
            Err(e) => {
                warn!(error = %e, "scheduled-job promotion failed");
                return;
            }
        }

        // 2. Free slots.
        let active = self.active.lock().len();
        let Some(free) = self.config.concurrency.checked_sub(active).filter(|f| *f > 0)
        else {
            return;
        };

        // 3-4. Fetch and claim.
        let pending = match self.store.get_pending(free).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "pending fetch failed");
                return;
            }
        };

        for job in pending {
            match self.store.claim(job.id.as_str(), self.clock.now_utc()).await {
                Ok(true) => {}
                // Another worker got it, or it moved.
                Ok(false) => continue,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "claim failed");
                    continue;
                }
            }

            self.active
                .lock()
                .insert(job.id.to_string(), job.external);

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if job.external {
                    inner.process_external_job(job).await;
                } else {
                    inner.process_inproc_job(job).await;
                }
            });
        }
    }

    // -- in-process dispatch ------------------------------------------------

    async fn process_inproc_job(self: &Arc<Self>, job: Job) {
        // Lookup in its own scope; the guard must not be held across awaits.
        let handler = {
            let handlers = self.handlers.lock();
            match handlers.get(&job.name) {
                Some(Registered::InProc(handler)) => Some(Arc::clone(handler)),
                _ => None,
            }
        };
        let Some(handler) = handler else {
            // Registration disappeared between enqueue and dispatch.
            self.take_active(job.id.as_str());
            self.fail_attempt(&job, job.attempts + 1, "handler no longer registered")
                .await;
            return;
        };

        // Attempts count executions, not failures.
        let attempts = job.attempts + 1;
        let _ = self
            .store
            .update(job.id.as_str(), JobUpdate::new().attempts(attempts))
            .await;

        let ctx = JobContext {
            job_id: job.id.clone(),
            name: job.name.clone(),
            payload: job.payload.clone(),
            events: self.events.clone(),
        };

        match handler.run(ctx).await {
            Ok(result) => {
                if self.take_active(job.id.as_str()) {
                    self.finalize_completed(&job, Some(result)).await;
                }
            }
            Err(e) => {
                if self.take_active(job.id.as_str()) {
                    self.fail_attempt(&job, attempts, &e.0).await;
                }
            }
        }
    }

    // -- external dispatch --------------------------------------------------

    async fn process_external_job(self: &Arc<Self>, job: Job) {
        let config = {
            let handlers = self.handlers.lock();
            match handlers.get(&job.name) {
                Some(Registered::External(config)) => Some(config.clone()),
                _ => None,
            }
        };
        let Some(config) = config else {
            self.take_active(job.id.as_str());
            self.fail_attempt(&job, job.attempts + 1, "handler no longer registered")
                .await;
            return;
        };

        let id = job.id.to_string();
        let attempts = job.attempts + 1;

        // Listener first, so the child can connect as soon as it starts.
        let endpoint = match self.broker.create_socket(SocketKind::Job, &id).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.take_active(&id);
                self.fail_attempt(&job, attempts, &format!("socket setup failed: {e}"))
                    .await;
                return;
            }
        };

        let now = self.clock.now_utc();
        let _ = self
            .store
            .update(
                &id,
                JobUpdate::new()
                    .socket_path(endpoint.unix_path().map(Into::into))
                    .tcp_port(endpoint.tcp_port())
                    .process_state(Some(ProcessState::Spawning))
                    .last_heartbeat(Some(now))
                    .attempts(attempts),
            )
            .await;

        // Identity + endpoint env, then the registered extras.
        let child_env = ChildEnv {
            ident: FrameIdent::job(id.clone()),
            endpoint: endpoint.clone(),
            metadata: config.metadata.clone(),
            job_name: Some(job.name.clone()),
        };
        let mut env = child_env.to_env();
        env.extend(config.env.iter().cloned());

        let stdin_line = json!({
            "jobId": id,
            "name": job.name,
            "data": job.payload,
            "socketPath": endpoint.as_url(),
        })
        .to_string();

        let spec = SpawnSpec {
            command: config.command.clone(),
            args: config.args.clone(),
            env,
            cwd: config.cwd.clone(),
            stdin_line: Some(stdin_line),
        };

        let child = match self.spawner.spawn(spec).await {
            Ok(child) => child,
            Err(e) => {
                self.take_active(&id);
                self.cleanup_child(&id);
                self.fail_attempt(&job, attempts, &e.to_string()).await;
                return;
            }
        };

        let pid = child.pid;
        let _ = self
            .store
            .update(&id, JobUpdate::new().pid(Some(pid)))
            .await;
        info!(job_id = %id, name = %job.name, pid, "external job spawned");

        self.attach_frame_processor(&id);
        self.stream_child_output(&id, child.stdout, "stdout");
        self.stream_child_output(&id, child.stderr, "stderr");

        // Optional per-attempt timeout.
        if let Some(timeout_ms) = config.timeout_ms {
            let inner = Arc::clone(self);
            let job = job.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if inner.active.lock().contains_key(job.id.as_str()) {
                    warn!(job_id = %job.id, "job timeout, escalating kill");
                    kill::escalate(
                        &*inner.spawner,
                        pid,
                        config.kill_grace_ms.unwrap_or(inner.config.kill_grace_ms),
                    )
                    .await;
                }
            });
        }

        // Exit watcher: only relevant when no terminal frame arrived.
        let inner = Arc::clone(self);
        let exit_job = job.clone();
        tokio::spawn(async move {
            let code = child.exit.await.ok().flatten();
            // A retry may already be running a fresh process; only the
            // watcher whose pid still owns the record may terminalize it.
            match inner.store.get(exit_job.id.as_str()).await {
                Ok(Some(current)) if current.pid == Some(pid) => {}
                _ => return,
            }
            if !inner.take_active(exit_job.id.as_str()) {
                return;
            }
            match code {
                Some(0) => inner.finalize_completed(&exit_job, None).await,
                Some(code) => {
                    inner
                        .fail_attempt(
                            &exit_job,
                            exit_job.attempts + 1,
                            &format!("Process exited with code {code}"),
                        )
                        .await
                }
                None => {
                    inner
                        .fail_attempt(&exit_job, exit_job.attempts + 1, "Process killed by signal")
                        .await
                }
            }
        });
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
                    "job.external.log",
                    json!({ "jobId": id, "stream": stream, "line": line }),
                );
            }
        });
    }

    /// Create the per-job frame channel and its ordered processor task.
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
        // Every frame is a liveness hint.
        let now = self.clock.now_utc();
        let _ = self
            .store
            .update(id, JobUpdate::new().last_heartbeat(Some(now)))
            .await;

        match frame.body {
            FrameBody::Connected | FrameBody::Started => {
                let _ = self
                    .store
                    .update(
                        id,
                        JobUpdate::new().process_state(Some(ProcessState::Running)),
                    )
                    .await;
            }
            FrameBody::Heartbeat => {}
            FrameBody::Progress { percent, message, data } => {
                let payload = json!({
                    "jobId": id,
                    "percent": percent,
                    "message": message,
                    "data": data,
                });
                self.events.publish("job.progress", payload.clone());
                if let Ok(Some(job)) = self.store.get(id).await {
                    self.events
                        .publish(&format!("job.{}.progress", job.name), payload);
                }
            }
            FrameBody::Log { level, message, data } => {
                self.events.publish(
                    "job.log",
                    json!({ "jobId": id, "level": level, "message": message, "data": data }),
                );
            }
            FrameBody::Stats { cpu, memory, uptime } => {
                self.events.publish(
                    "job.stats",
                    json!({ "jobId": id, "cpu": cpu, "memory": memory, "uptime": uptime }),
                );
            }
            FrameBody::Completed { result } => {
                if self.take_active(id) {
                    if let Ok(Some(job)) = self.store.get(id).await {
                        self.finalize_completed(&job, result).await;
                    }
                }
            }
            FrameBody::Failed { error, stack } => {
                if self.take_active(id) {
                    if let Ok(Some(job)) = self.store.get(id).await {
                        let error = match stack {
                            Some(stack) => format!("{error}\n{stack}"),
                            None => error,
                        };
                        // Attempts were already counted at spawn.
                        self.fail_attempt(&job, job.attempts.max(1), &error).await;
                    }
                }
            }
            FrameBody::Disconnecting => {
                debug!(job_id = id, "child announced disconnect");
            }
            // Workflow-executor frames never arrive on job sockets.
            other => debug!(job_id = id, frame = ?other, "unexpected frame kind ignored"),
        }
    }

    // -- terminalization ----------------------------------------------------

    /// Remove a job from the active set. Whoever wins this owns the
    /// record's terminal transition; later callers must back off.
    fn take_active(&self, id: &str) -> bool {
        self.active.lock().remove(id).is_some()
    }

    async fn finalize_completed(&self, job: &Job, result: Option<Value>) {
        let now = self.clock.now_utc();
        let _ = self
            .store
            .update(
                job.id.as_str(),
                JobUpdate::new()
                    .status(JobStatus::Completed)
                    .result(result.clone())
                    .completed_at(Some(now)),
            )
            .await;
        if job.external {
            self.cleanup_child(job.id.as_str());
        }
        let payload = json!({ "jobId": job.id.as_str(), "result": result });
        self.events.publish("job.completed", payload.clone());
        self.events
            .publish(&format!("job.{}.completed", job.name), payload);
        info!(job_id = %job.id, name = %job.name, "job completed");
    }

    /// A failed attempt: requeue with backoff while budget remains,
    /// otherwise fail terminally.
    async fn fail_attempt(&self, job: &Job, attempts: u32, error: &str) {
        if job.external {
            self.cleanup_child(job.id.as_str());
        }

        if attempts < job.max_attempts {
            let update = if self.config.retry_backoff {
                let delay = queue_backoff(
                    self.config.backoff_base_ms,
                    self.config.backoff_max_ms,
                    attempts,
                );
                let run_at = self.clock.now_utc()
                    + ChronoDuration::milliseconds(delay.as_millis() as i64);
                JobUpdate::new()
                    .status(JobStatus::Scheduled)
                    .run_at(Some(run_at))
            } else {
                JobUpdate::new().status(JobStatus::Pending)
            };
            let _ = self
                .store
                .update(
                    job.id.as_str(),
                    update
                        .attempts(attempts)
                        .last_error(Some(error.to_string()))
                        .pid(None)
                        .process_state(job.external.then_some(ProcessState::Spawning)),
                )
                .await;
            debug!(job_id = %job.id, attempts, error, "attempt failed, requeued");
            return;
        }

        self.finalize_failed(job, attempts, error, None).await;
    }

    /// Terminal failure that bypasses the retry budget (cancel, watchdog,
    /// recovery of a dead child).
    async fn finalize_failed_terminal(
        &self,
        job: &Job,
        error: &str,
        process_state: Option<ProcessState>,
    ) {
        self.take_active(job.id.as_str());
        if job.external {
            self.cleanup_child(job.id.as_str());
        }
        self.finalize_failed(job, job.attempts.max(1), error, process_state)
            .await;
    }

    async fn finalize_failed(
        &self,
        job: &Job,
        attempts: u32,
        error: &str,
        process_state: Option<ProcessState>,
    ) {
        let now = self.clock.now_utc();
        let mut update = JobUpdate::new()
            .status(JobStatus::Failed)
            .attempts(attempts)
            .last_error(Some(error.to_string()))
            .completed_at(Some(now));
        if let Some(state) = process_state {
            update = update.process_state(Some(state));
        }
        let _ = self.store.update(job.id.as_str(), update).await;

        let payload = json!({
            "jobId": job.id.as_str(),
            "error": error,
            "attempts": attempts,
        });
        self.events.publish("job.failed", payload.clone());
        self.events
            .publish(&format!("job.{}.failed", job.name), payload);
        warn!(job_id = %job.id, name = %job.name, error, "job failed");
    }

    /// Release socket resources and the frame channel for one child.
    fn cleanup_child(&self, id: &str) {
        self.frame_txs.lock().remove(id);
        self.broker.close_socket(SocketKind::Job, id);
        self.broker.release(SocketKind::Job, id);
    }
}

fn stored_endpoint(job: &Job) -> Option<Endpoint> {
    if let Some(ref path) = job.socket_path {
        return Some(Endpoint::Unix(path.clone()));
    }
    job.tcp_port.map(Endpoint::Tcp)
}

#[cfg(test)]
#[path = "jobs_tests.rs"]
mod tests;
