// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Public workflow engine: registration, concurrency gates, start/cancel,
//! and the choice between inline and isolated execution.

use super::definition::WorkflowDefinition;
use super::isolated;
use super::machine::{JobDelegate, StateMachine};
use super::observer::{EventObserver, WorkflowObserver};
use super::registry::{ServiceRegistry, WorkflowRegistry};
use crate::error::EngineError;
use crate::kill;
use crate::router::{new_frame_txs, FrameRouter, FrameTxs};
use crate::spawner::Spawner;
use dl_core::{
    Clock, EventBus, InstanceId, InstanceUpdate, SystemClock, WatchdogMeta, WorkflowInstance,
    WorkflowStatus,
};
use dl_ipc::{Broker, SocketKind};
use dl_storage::WorkflowStore;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Subprocess execution wiring. Without it, `isolated` definitions run
/// inline (there is no executor binary or shared database to hand them).
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    pub runner_binary: PathBuf,
    pub db_path: PathBuf,
}

impl IsolationConfig {
    /// Resolve the runner binary from the environment
    /// (`DONKEYLABS_RUNNER_BINARY`, then a sibling of the current exe).
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            runner_binary: crate::env::runner_binary(),
            db_path: db_path.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowsConfig {
    /// Global cap on pending+running instances.
    pub concurrent_workflows: Option<usize>,
    pub isolation: Option<IsolationConfig>,
}

/// The workflow engine. Cheap to clone; all state is shared.
pub struct Workflows<C: Clock = SystemClock> {
    pub(super) inner: Arc<WfInner<C>>,
}

impl<C: Clock> Clone for Workflows<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

pub(super) struct WfInner<C: Clock> {
    pub(super) store: Arc<dyn WorkflowStore>,
    pub(super) events: EventBus,
    pub(super) broker: Arc<Broker>,
    pub(super) spawner: Arc<dyn Spawner>,
    pub(super) registry: WorkflowRegistry,
    pub(super) services: Arc<ServiceRegistry>,
    pub(super) machine: Arc<StateMachine<C>>,
    pub(super) observer: Arc<dyn WorkflowObserver>,
    pub(super) config: WorkflowsConfig,
    pub(super) clock: C,
    pub(super) frame_txs: FrameTxs,
}

impl Workflows<SystemClock> {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        events: EventBus,
        broker: Arc<Broker>,
        spawner: Arc<dyn Spawner>,
        config: WorkflowsConfig,
    ) -> Self {
        Self::with_clock(store, events, broker, spawner, config, SystemClock)
    }
}

impl<C: Clock> Workflows<C> {
    pub fn with_clock(
        store: Arc<dyn WorkflowStore>,
        events: EventBus,
        broker: Arc<Broker>,
        spawner: Arc<dyn Spawner>,
        config: WorkflowsConfig,
        clock: C,
    ) -> Self {
        let services = Arc::new(ServiceRegistry::new());
        let observer: Arc<dyn WorkflowObserver> = Arc::new(EventObserver::new(events.clone()));
        let machine = Arc::new(StateMachine::new(
            Arc::clone(&store),
            events.clone(),
            Arc::clone(&services),
            Arc::clone(&observer),
            clock.clone(),
        ));
        let frame_txs = new_frame_txs();
        broker.set_handler(
            SocketKind::Wfl,
            Arc::new(FrameRouter::new(Arc::clone(&frame_txs))),
        );
        Self {
            inner: Arc::new(WfInner {
                store,
                events,
                broker,
                spawner,
                registry: WorkflowRegistry::new(),
                services,
                machine,
                observer,
                config,
                clock,
                frame_txs,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The dynamic service map shared with step contexts.
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.inner.services
    }

    /// Wire the jobs engine for task-by-job steps.
    pub fn set_job_delegate(&self, delegate: Arc<dyn JobDelegate>) {
        self.inner.machine.set_job_delegate(delegate);
    }

    pub fn register(&self, def: WorkflowDefinition) -> Result<(), EngineError> {
        self.inner.registry.register(def)
    }

    /// Start a run of a registered definition.
    pub async fn start(&self, name: &str, input: Value) -> Result<InstanceId, EngineError> {
        self.start_with_metadata(name, input, serde_json::Map::new())
            .await
    }

    pub async fn start_with_metadata(
        &self,
        name: &str,
        input: Value,
        metadata: serde_json::Map<String, Value>,
    ) -> Result<InstanceId, EngineError> {
        let def = self
            .inner
            .registry
            .get(name)
            .ok_or_else(|| EngineError::UnknownWorkflow(name.to_string()))?;

        // Concurrency gates, checked before anything is persisted.
        if let Some(cap) = self.inner.config.concurrent_workflows {
            if self.inner.store.count_running(None).await? >= cap {
                return Err(EngineError::ConcurrencyLimit {
                    scope: "workflows".to_string(),
                    limit: cap,
                });
            }
        }
        if let Some(cap) = def.max_concurrent {
            if self.inner.store.count_running(Some(name)).await? >= cap {
                return Err(EngineError::ConcurrencyLimit {
                    scope: name.to_string(),
                    limit: cap,
                });
            }
        }

        let isolated = def.isolated && self.inner.config.isolation.is_some();
        if isolated {
            if let Some(service) = self.inner.services.first_non_serializable() {
                return Err(EngineError::NonSerializableConfig(service));
            }
        }

        let mut instance =
            WorkflowInstance::new(name, def.start.clone(), input, self.inner.clock.now_utc());
        instance.metadata = metadata;
        self.inner.store.create(&instance).await?;
        let id = instance.id.clone();

        if isolated {
            if let Err(e) = isolated::launch(&self.inner, &instance).await {
                // Never leave a pending record nobody will drive.
                let _ = self
                    .inner
                    .store
                    .update(
                        id.as_str(),
                        InstanceUpdate::new()
                            .status(WorkflowStatus::Failed)
                            .error(Some(format!("executor spawn failed: {e}")))
                            .completed_at(Some(self.inner.clock.now_utc())),
                    )
                    .await;
                return Err(e);
            }
        } else {
            let machine = Arc::clone(&self.inner.machine);
            let def = Arc::clone(&def);
            let run_id = id.to_string();
            tokio::spawn(async move {
                let _ = machine.run_boxed(run_id, def).await;
            });
        }

        info!(instance_id = %id, workflow = name, isolated, "workflow started");
        Ok(id)
    }

    /// Cancel a run.
    ///
    /// Inline runs get a cooperative flag the driver observes between
    /// steps (sub-instances inherit it); the flag is cleared once
    /// observed, so the same instance id may be re-run later. Isolated
    /// runs have their executor killed with the graceful escalation.
    pub async fn cancel(&self, id: &str) -> Result<bool, EngineError> {
        let Some(instance) = self.inner.store.get(id).await? else {
            return Ok(false);
        };
        if instance.is_terminal() {
            return Ok(false);
        }

        if let Some(meta) = instance.watchdog_meta() {
            kill::escalate(&*self.inner.spawner, meta.pid, 5_000).await;
            isolated::cleanup_child(&self.inner, id);
            self.inner
                .store
                .update(
                    id,
                    InstanceUpdate::new()
                        .status(WorkflowStatus::Cancelled)
                        .completed_at(Some(self.inner.clock.now_utc())),
                )
                .await?;
            self.inner
                .events
                .publish("workflow.cancelled", json!({ "instanceId": id }));
            return Ok(true);
        }

        self.inner.machine.request_cancel(id);
        for ids in instance.branch_instances.values() {
            for sub in ids {
                self.inner.machine.request_cancel(sub.as_str());
            }
        }
        self.inner
            .events
            .publish("workflow.cancelled", json!({ "instanceId": id }));
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowInstance>, EngineError> {
        Ok(self.inner.store.get(id).await?)
    }

    pub async fn get_by_name(
        &self,
        name: &str,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.inner.store.get_by_name(name, status).await?)
    }

    /// Running instances policed by the watchdog (isolated executors).
    pub async fn running_with_watchdog(
        &self,
    ) -> Result<Vec<(WorkflowInstance, WatchdogMeta)>, EngineError> {
        let running = self.inner.store.get_running().await?;
        Ok(running
            .into_iter()
            .filter_map(|instance| {
                let meta = instance.watchdog_meta()?;
                Some((instance, meta))
            })
            .collect())
    }

    /// Watchdog entry point for an unresponsive isolated executor.
    pub async fn kill_stale(&self, instance: &WorkflowInstance) {
        let id = instance.id.as_str();
        self.inner
            .events
            .publish("workflow.watchdog.stale", json!({ "instanceId": id }));

        if let Some(meta) = instance.watchdog_meta() {
            kill::escalate(&*self.inner.spawner, meta.pid, 5_000).await;
        }
        isolated::cleanup_child(&self.inner, id);

        let error = "Watchdog killed unresponsive workflow";
        let _ = self
            .inner
            .store
            .update(
                id,
                InstanceUpdate::new()
                    .status(WorkflowStatus::Failed)
                    .error(Some(error.to_string()))
                    .completed_at(Some(self.inner.clock.now_utc())),
            )
            .await;
        if let Ok(Some(refreshed)) = self.inner.store.get(id).await {
            self.inner.observer.on_failed(&refreshed, error);
        }
        self.inner
            .events
            .publish("workflow.watchdog.killed", json!({ "instanceId": id }));
        warn!(instance_id = id, "watchdog killed unresponsive workflow");
    }

    /// SIGTERM isolated executors and stop the store.
    pub async fn shutdown(&self) {
        if let Ok(running) = self.inner.store.get_running().await {
            for instance in running {
                if let Some(meta) = instance.watchdog_meta() {
                    let _ = self
                        .inner
                        .spawner
                        .kill(meta.pid, crate::spawner::KillSignal::Term);
                }
                isolated::cleanup_child(&self.inner, instance.id.as_str());
            }
        }
        self.inner.store.stop().await;
        info!("workflow engine stopped");
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
