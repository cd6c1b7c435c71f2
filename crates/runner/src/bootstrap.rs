// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child half of isolated workflow execution.
//!
//! Reads one JSON config line from stdin, opens the shared database,
//! instantiates local services, connects back to the parent socket, emits
//! `ready`, and drives the state machine with an observer that serializes
//! every callback as an IPC frame. Exit code 0 on completion, 1 on any
//! failure.

use dl_core::{EventBus, SystemClock, WorkflowInstance};
use dl_engine::{ServiceRegistry, StateMachine, WorkflowDefinition, WorkflowObserver};
use dl_ipc::{ChildClient, ClientError, Endpoint, FrameBody, FrameIdent};
use dl_storage::{open_pool, SqliteWorkflowStore, StorageError, WorkflowStore};
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("stdin closed before the bootstrap line arrived")]
    NoConfig,

    #[error("invalid bootstrap config: {0}")]
    BadConfig(#[from] serde_json::Error),

    #[error("no workflow named {0:?} is compiled into this runner")]
    UnknownWorkflow(String),

    #[error("no plugin named {0:?} is compiled into this runner")]
    UnknownPlugin(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workflow failed: {0}")]
    WorkflowFailed(String),
}

/// Serialized plugin reference from the parent.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginRef {
    pub name: String,
    #[serde(default)]
    pub config: Option<Value>,
}

/// The one-line JSON config the parent writes to stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    #[serde(rename = "dbPath")]
    pub db_path: PathBuf,
    #[serde(rename = "workflowName")]
    pub workflow_name: String,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    /// Socket path, or `tcp://127.0.0.1:<port>`.
    #[serde(rename = "socketPath")]
    pub socket_path: String,
    #[serde(default)]
    pub plugins: Vec<PluginRef>,
}

/// A service the runner can reconstruct from its serialized config.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Build the service instance from the bound config.
    fn build(&self, config: Option<&Value>) -> Arc<dyn Any + Send + Sync>;

    /// Init hook, run after every plugin is registered.
    fn init(&self, _services: &ServiceRegistry) {}
}

/// Everything the embedding application compiles into its runner binary.
#[derive(Default)]
pub struct RunnerSetup {
    workflows: HashMap<String, WorkflowDefinition>,
    plugins: Vec<Box<dyn Plugin>>,
}

impl RunnerSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow(mut self, def: WorkflowDefinition) -> Self {
        self.workflows.insert(def.name.clone(), def);
        self
    }

    pub fn plugin(mut self, plugin: Box<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }
}

/// Observer that serializes every state-machine callback as an IPC frame.
///
/// Callbacks are synchronous; frames go through an ordered channel drained
/// by one sender task, so the parent sees them in callback order.
struct IpcObserver {
    tx: mpsc::UnboundedSender<FrameBody>,
}

impl IpcObserver {
    fn send(&self, body: FrameBody) {
        let _ = self.tx.send(body);
    }
}

impl WorkflowObserver for IpcObserver {
    fn on_step_started(&self, _instance: &WorkflowInstance, step: &str) {
        self.send(FrameBody::StepStarted { step: step.to_string() });
    }

    fn on_step_completed(&self, _instance: &WorkflowInstance, step: &str, output: &Value) {
        self.send(FrameBody::StepCompleted {
            step: step.to_string(),
            output: Some(output.clone()),
        });
    }

    fn on_step_failed(&self, _instance: &WorkflowInstance, step: &str, error: &str) {
        self.send(FrameBody::StepFailed {
            step: step.to_string(),
            error: error.to_string(),
        });
    }

    fn on_step_poll(&self, _instance: &WorkflowInstance, step: &str, poll_count: u32) {
        self.send(FrameBody::StepPoll { step: step.to_string(), poll_count });
    }

    fn on_step_loop(&self, _instance: &WorkflowInstance, step: &str, loop_count: u32) {
        self.send(FrameBody::StepLoop { step: step.to_string(), loop_count });
    }

    fn on_progress(&self, _instance: &WorkflowInstance, percent: u32) {
        self.send(FrameBody::Progress {
            percent: percent as f64,
            message: None,
            data: None,
        });
    }

    // Terminal frames are sent by `run` after teardown, with the final
    // result; the observer stays quiet here to avoid double terminals.
    fn on_completed(&self, _instance: &WorkflowInstance, _output: &Value) {}
    fn on_failed(&self, _instance: &WorkflowInstance, _error: &str) {}
}

/// Read the bootstrap line from this process's stdin.
pub async fn read_stdin_config() -> Result<BootstrapConfig, BootstrapError> {
    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(BootstrapError::NoConfig);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Execute the configured instance. Returns the process exit code.
pub async fn run(setup: RunnerSetup) -> i32 {
    let config = match read_stdin_config().await {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "bootstrap failed before connect");
            return 1;
        }
    };
    match run_with_config(setup, config).await {
        Ok(()) => 0,
        Err(e) => {
            warn!(error = %e, "executor failed");
            1
        }
    }
}

/// Bootstrap and drive one instance (separated from [`run`] for tests).
pub async fn run_with_config(
    setup: RunnerSetup,
    config: BootstrapConfig,
) -> Result<(), BootstrapError> {
    info!(
        workflow = %config.workflow_name,
        instance_id = %config.instance_id,
        db = %config.db_path.display(),
        "executor bootstrapping"
    );

    let def = setup
        .workflows
        .get(&config.workflow_name)
        .cloned()
        .ok_or_else(|| BootstrapError::UnknownWorkflow(config.workflow_name.clone()))?;

    // Shared database, same schema and pragmas as the parent.
    let pool = open_pool(&config.db_path).await?;
    let store: Arc<dyn WorkflowStore> = Arc::new(SqliteWorkflowStore::open(pool).await?);

    // Local services from the serialized plugin configs.
    let services = Arc::new(ServiceRegistry::new());
    for plugin_ref in &config.plugins {
        let plugin = setup
            .plugins
            .iter()
            .find(|p| p.name() == plugin_ref.name)
            .ok_or_else(|| BootstrapError::UnknownPlugin(plugin_ref.name.clone()))?;
        let service = plugin.build(plugin_ref.config.as_ref());
        services.register_boxed(&plugin_ref.name, service, plugin_ref.config.clone());
        debug!(plugin = %plugin_ref.name, "plugin registered");
    }
    for plugin in &setup.plugins {
        plugin.init(&services);
    }

    // Connect back and announce readiness.
    let endpoint = Endpoint::parse_url(&config.socket_path);
    let ident = FrameIdent::instance(config.instance_id.clone());
    let client = Arc::new(ChildClient::connect(&endpoint, ident).await?);
    let heartbeat = client.start_heartbeat(Duration::from_secs(5));
    client.send(FrameBody::Ready).await?;

    // Frame sender: observer callbacks and local events, in order.
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<FrameBody>();
    let sender_client = Arc::clone(&client);
    let sender = tokio::spawn(async move {
        while let Some(body) = frame_rx.recv().await {
            if sender_client.send(body).await.is_err() {
                break;
            }
        }
    });

    // Application events published inside this process are mirrored up.
    let events = EventBus::new();
    let event_tx = frame_tx.clone();
    let event_sub = events.subscribe("*", move |event| {
        let _ = event_tx.send(FrameBody::ChildEvent {
            topic: event.topic.clone(),
            payload: event.payload.clone(),
        });
    });

    let observer: Arc<dyn WorkflowObserver> =
        Arc::new(IpcObserver { tx: frame_tx.clone() });

    let machine = Arc::new(StateMachine::new(
        Arc::clone(&store),
        events.clone(),
        services,
        observer,
        SystemClock,
    ));

    client.send(FrameBody::Started).await?;
    let outcome = machine.run(&config.instance_id, Arc::new(def)).await;

    // The terminal frame goes through the same ordered channel so it can
    // never overtake queued lifecycle frames.
    let (terminal, result) = match outcome {
        Ok(output) => (FrameBody::Completed { result: Some(output) }, Ok(())),
        Err(e) => (
            FrameBody::Failed { error: e.to_string(), stack: None },
            Err(BootstrapError::WorkflowFailed(e.to_string())),
        ),
    };
    let _ = frame_tx.send(terminal);

    // Unsubscribing drops the event mirror's sender; with ours dropped too
    // the channel closes and the sender task drains out.
    events.unsubscribe(event_sub);
    drop(frame_tx);
    let _ = sender.await;
    heartbeat.abort();
    client.disconnect().await;
    store.stop().await;
    result
}

#[cfg(test)]
#[path = "bootstrap_tests.rs"]
mod tests;
