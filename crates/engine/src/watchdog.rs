// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Watchdog: the gap-closer between what the database says is alive and
//! what actually is.
//!
//! One periodic pass scans all three stores. Stale children (heartbeat
//! silence), over-deadline jobs, and over-runtime processes all route
//! through the shared graceful-kill escalation owned by their engine.

use crate::jobs::Jobs;
use crate::supervisor::Supervisor;
use crate::workflow::Workflows;
use chrono::{DateTime, Utc};
use dl_core::{Clock, SystemClock};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Scan interval; clamped to at least one second.
    pub interval: Duration,
    /// Heartbeat budget for isolated workflow executors.
    pub workflow_heartbeat_timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            workflow_heartbeat_timeout_ms: 30_000,
        }
    }
}

/// The watchdog runner. Engines are optional; absent ones are skipped.
pub struct Watchdog<C: Clock = SystemClock> {
    inner: Arc<WdInner<C>>,
}

impl<C: Clock> Clone for Watchdog<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct WdInner<C: Clock> {
    config: WatchdogConfig,
    clock: C,
    jobs: Option<Jobs<C>>,
    supervisor: Option<Supervisor<C>>,
    workflows: Option<Workflows<C>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for a watchdog before it starts.
pub struct WatchdogBuilder<C: Clock> {
    config: WatchdogConfig,
    clock: C,
    jobs: Option<Jobs<C>>,
    supervisor: Option<Supervisor<C>>,
    workflows: Option<Workflows<C>>,
}

impl WatchdogBuilder<SystemClock> {
    pub fn new(config: WatchdogConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> WatchdogBuilder<C> {
    pub fn with_clock(config: WatchdogConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            jobs: None,
            supervisor: None,
            workflows: None,
        }
    }

    pub fn jobs(mut self, jobs: Jobs<C>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn supervisor(mut self, supervisor: Supervisor<C>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn workflows(mut self, workflows: Workflows<C>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    pub fn build(self) -> Watchdog<C> {
        Watchdog {
            inner: Arc::new(WdInner {
                config: self.config,
                clock: self.clock,
                jobs: self.jobs,
                supervisor: self.supervisor,
                workflows: self.workflows,
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }
}

impl<C: Clock> Watchdog<C> {
    /// Start the periodic scan loop.
    pub fn start(&self) {
        let interval = self.inner.config.interval.max(Duration::from_secs(1));
        let inner = Arc::clone(&self.inner);
        let watchdog = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => watchdog.pass().await,
                    _ = inner.cancel.cancelled() => break,
                }
            }
        });
        *self.inner.task.lock() = Some(task);
        info!("watchdog started");
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
    }

    /// One scan over workflows, jobs, and processes.
    pub async fn pass(&self) {
        let now = self.inner.clock.now_utc();

        if let Some(ref workflows) = self.inner.workflows {
            if let Ok(policed) = workflows.running_with_watchdog().await {
                for (instance, meta) in policed {
                    if elapsed_ms(now, meta.last_heartbeat)
                        > self.inner.config.workflow_heartbeat_timeout_ms
                    {
                        workflows.kill_stale(&instance).await;
                    }
                }
            }
        }

        if let Some(ref jobs) = self.inner.jobs {
            if let Ok(running) = jobs.get_running_external().await {
                for job in running {
                    let policy = jobs.kill_policy(&job.name);

                    let heartbeat = job.last_heartbeat.or(job.started_at);
                    if let Some(heartbeat) = heartbeat {
                        if elapsed_ms(now, heartbeat) > policy.heartbeat_timeout_ms {
                            jobs.kill_stale(&job, "heartbeat").await;
                            continue;
                        }
                    }

                    if let (Some(timeout_ms), Some(started)) = (policy.timeout_ms, job.started_at)
                    {
                        if elapsed_ms(now, started) > timeout_ms {
                            jobs.kill_stale(&job, "timeout").await;
                        }
                    }
                }
            }
        }

        if let Some(ref supervisor) = self.inner.supervisor {
            if let Ok(running) = supervisor.list().await {
                for proc in running {
                    if proc.status != dl_core::ProcStatus::Running {
                        continue;
                    }

                    let heartbeat = proc.last_heartbeat.or(proc.started_at);
                    if let Some(heartbeat) = heartbeat {
                        if elapsed_ms(now, heartbeat) > proc.spec.heartbeat_timeout_ms {
                            supervisor.kill_stale(&proc, "heartbeat").await;
                            continue;
                        }
                    }

                    if let (Some(max_runtime), Some(started)) =
                        (proc.spec.max_runtime_ms, proc.started_at)
                    {
                        if elapsed_ms(now, started) > max_runtime {
                            supervisor.kill_stale(&proc, "runtime").await;
                        }
                    }
                }
            }
        }
    }
}

fn elapsed_ms(now: DateTime<Utc>, since: DateTime<Utc>) -> u64 {
    now.signed_duration_since(since).num_milliseconds().max(0) as u64
}

#[cfg(test)]
#[path = "watchdog_tests.rs"]
mod tests;
