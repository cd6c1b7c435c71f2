// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use dl_core::Clock;
use dl_engine::Step;
use dl_ipc::{Broker, BrokerConfig, BrokerError, BrokerHandler, Frame, SocketKind};
use dl_storage::SqliteWorkflowStore;
use parking_lot::Mutex as SyncMutex;
use serde_json::json;

#[derive(Default)]
struct Collect {
    frames: SyncMutex<Vec<Frame>>,
}

impl BrokerHandler for Collect {
    fn on_frame(&self, _kind: SocketKind, _id: &str, frame: Frame) {
        self.frames.lock().push(frame);
    }

    fn on_error(&self, _kind: SocketKind, _id: &str, _error: BrokerError) {}
}

struct ParentSide {
    broker: Broker,
    collect: Arc<Collect>,
    store: SqliteWorkflowStore,
    config: BootstrapConfig,
    _dir: tempfile::TempDir,
}

/// Stand up the parent half: a listener, a shared database, and a pending
/// instance record for the given workflow.
async fn parent_side(workflow: &str, input: Value) -> ParentSide {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("core.db");

    let pool = open_pool(&db_path).await.unwrap();
    let store = SqliteWorkflowStore::open(pool).await.unwrap();
    let instance =
        WorkflowInstance::new(workflow, "first", input, SystemClock.now_utc());
    store.create(&instance).await.unwrap();

    let broker = Broker::new(BrokerConfig::new(dir.path()));
    let collect = Arc::new(Collect::default());
    broker.set_handler(SocketKind::Wfl, Arc::clone(&collect) as Arc<dyn BrokerHandler>);
    let endpoint = broker
        .create_socket(SocketKind::Wfl, instance.id.as_str())
        .await
        .unwrap();

    let config = BootstrapConfig {
        db_path,
        workflow_name: workflow.to_string(),
        instance_id: instance.id.to_string(),
        socket_path: endpoint.as_url(),
        plugins: Vec::new(),
    };
    ParentSide { broker, collect, store, config, _dir: dir }
}

fn two_step_setup() -> RunnerSetup {
    RunnerSetup::new().workflow(
        WorkflowDefinition::new("ship", "first")
            .step(
                "first",
                Step::task(|ctx| async move {
                    Ok(json!({ "doubled": ctx.input["n"].as_i64().unwrap_or(0) * 2 }))
                })
                .next("second"),
            )
            .step(
                "second",
                Step::task(|ctx| async move { Ok(json!({ "final": ctx.prev["doubled"] })) })
                    .end(),
            ),
    )
}

#[tokio::test]
async fn executor_drives_instance_and_streams_lifecycle() {
    let parent = parent_side("ship", json!({"n": 21})).await;

    run_with_config(two_step_setup(), parent.config.clone())
        .await
        .unwrap();

    // The shared record is terminal with the final output.
    let instance = parent
        .store
        .get(&parent.config.instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, dl_core::WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!({"final": 42})));

    // Lifecycle frames arrived in protocol order.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let frames = parent.collect.frames.lock();
    let kinds: Vec<String> = frames
        .iter()
        .filter_map(|f| {
            serde_json::to_value(f).ok().and_then(|v| {
                v.get("type").and_then(|t| t.as_str()).map(String::from)
            })
        })
        .filter(|t| t != "heartbeat")
        .collect();
    assert_eq!(
        kinds,
        vec![
            "connected",
            "ready",
            "started",
            "step.started",
            "step.completed",
            "progress",
            "step.started",
            "step.completed",
            "progress",
            "completed",
            "disconnecting",
        ]
    );

    // Every frame carried the instance identity.
    for frame in frames.iter() {
        assert_eq!(frame.ident.id(), parent.config.instance_id);
    }
    drop(frames);
    parent.broker.shutdown();
}

#[tokio::test]
async fn failing_workflow_sends_failed_frame_and_nonzero_result() {
    let parent = parent_side("doomed", json!({})).await;

    let setup = RunnerSetup::new().workflow(
        WorkflowDefinition::new("doomed", "first").step(
            "first",
            Step::task(|_| async { Err(dl_engine::StepError::new("kaboom")) }).end(),
        ),
    );

    let err = run_with_config(setup, parent.config.clone()).await.unwrap_err();
    assert!(matches!(err, BootstrapError::WorkflowFailed(_)));

    let instance = parent
        .store
        .get(&parent.config.instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, dl_core::WorkflowStatus::Failed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let frames = parent.collect.frames.lock();
    assert!(frames.iter().any(|f| matches!(
        &f.body,
        FrameBody::Failed { error, .. } if error.contains("kaboom")
    )));
    assert!(frames
        .iter()
        .any(|f| matches!(&f.body, FrameBody::StepFailed { step, .. } if step == "first")));
}

#[tokio::test]
async fn unknown_workflow_is_rejected_before_connecting() {
    let parent = parent_side("registered-elsewhere", json!({})).await;

    let err = run_with_config(RunnerSetup::new(), parent.config.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::UnknownWorkflow(name) if name == "registered-elsewhere"));
}

struct GreeterPlugin;

struct Greeter {
    greeting: String,
}

impl Plugin for GreeterPlugin {
    fn name(&self) -> &str {
        "greeter"
    }

    fn build(&self, config: Option<&Value>) -> Arc<dyn std::any::Any + Send + Sync> {
        let greeting = config
            .and_then(|c| c["greeting"].as_str())
            .unwrap_or("hello")
            .to_string();
        Arc::new(Greeter { greeting })
    }
}

#[tokio::test]
async fn plugins_are_rebuilt_from_serialized_configs() {
    let mut parent = parent_side("greets", json!({})).await;
    parent.config.plugins = vec![PluginRef {
        name: "greeter".into(),
        config: Some(json!({"greeting": "ahoy"})),
    }];

    let setup = RunnerSetup::new()
        .plugin(Box::new(GreeterPlugin))
        .workflow(
            WorkflowDefinition::new("greets", "first").step(
                "first",
                Step::task(|ctx| async move {
                    let greeter = ctx
                        .service::<Greeter>("greeter")
                        .ok_or_else(|| dl_engine::StepError::new("greeter missing"))?;
                    Ok(json!({ "said": greeter.greeting }))
                })
                .end(),
            ),
        );

    run_with_config(setup, parent.config.clone()).await.unwrap();

    let instance = parent
        .store
        .get(&parent.config.instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.output, Some(json!({"said": "ahoy"})));
}

#[tokio::test]
async fn missing_plugin_is_rejected() {
    let mut parent = parent_side("greets", json!({})).await;
    parent.config.plugins = vec![PluginRef { name: "ghost".into(), config: None }];

    let setup = RunnerSetup::new().workflow(
        WorkflowDefinition::new("greets", "first")
            .step("first", Step::pass(json!(1)).end()),
    );

    let err = run_with_config(setup, parent.config.clone()).await.unwrap_err();
    assert!(matches!(err, BootstrapError::UnknownPlugin(name) if name == "ghost"));
}
