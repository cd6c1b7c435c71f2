// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::fake_spawner::FakeSpawner;
use crate::workflow::definition::Step;
use dl_core::FakeClock;
use dl_ipc::BrokerConfig;
use dl_storage::MemoryWorkflowStore;
use serde_json::json;
use std::time::Duration;

struct Harness {
    workflows: Workflows<FakeClock>,
    store: Arc<MemoryWorkflowStore>,
    spawner: FakeSpawner,
    _dir: tempfile::TempDir,
}

fn harness(config: WorkflowsConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryWorkflowStore::new());
    let spawner = FakeSpawner::new();
    let broker = Arc::new(Broker::new(BrokerConfig::new(dir.path())));
    let workflows = Workflows::with_clock(
        Arc::clone(&store) as Arc<dyn WorkflowStore>,
        EventBus::new(),
        broker,
        Arc::new(spawner.clone()),
        config,
        FakeClock::new(),
    );
    Harness { workflows, store, spawner, _dir: dir }
}

fn isolation(dir: &std::path::Path) -> IsolationConfig {
    IsolationConfig {
        runner_binary: PathBuf::from("dl-workflow-runner"),
        db_path: dir.join("core.db"),
    }
}

async fn wait_for_status(h: &Harness, id: &str, status: WorkflowStatus) -> WorkflowInstance {
    for _ in 0..300 {
        if let Some(instance) = h.workflows.get(id).await.unwrap() {
            if instance.status == status {
                return instance;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("instance {id} never reached {status}");
}

fn trivial_def(name: &str) -> WorkflowDefinition {
    WorkflowDefinition::new(name, "only")
        .step("only", Step::pass(json!("ok")).end())
        .inline()
}

#[tokio::test]
async fn start_unknown_workflow_is_rejected() {
    let h = harness(WorkflowsConfig::default());
    let err = h.workflows.start("ghost", json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownWorkflow(name) if name == "ghost"));
}

#[tokio::test]
async fn duplicate_definition_is_rejected() {
    let h = harness(WorkflowsConfig::default());
    h.workflows.register(trivial_def("dup")).unwrap();
    let err = h.workflows.register(trivial_def("dup")).unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRegistered(_)));
}

#[tokio::test]
async fn inline_run_completes_through_facade() {
    let h = harness(WorkflowsConfig::default());
    h.workflows.register(trivial_def("simple")).unwrap();

    let id = h.workflows.start("simple", json!({})).await.unwrap();
    let instance = wait_for_status(&h, id.as_str(), WorkflowStatus::Completed).await;
    assert_eq!(instance.output, Some(json!("ok")));
}

#[tokio::test]
async fn global_concurrency_gate() {
    let h = harness(WorkflowsConfig {
        concurrent_workflows: Some(1),
        ..Default::default()
    });
    let def = WorkflowDefinition::new("slow", "only")
        .step(
            "only",
            Step::task(|_| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!("done"))
            })
            .end(),
        )
        .inline();
    h.workflows.register(def).unwrap();

    h.workflows.start("slow", json!({})).await.unwrap();
    let err = h.workflows.start("slow", json!({})).await.unwrap_err();
    assert!(
        matches!(err, EngineError::ConcurrencyLimit { ref scope, limit: 1 } if scope == "workflows")
    );
}

#[tokio::test]
async fn per_definition_concurrency_gate() {
    let h = harness(WorkflowsConfig::default());
    let def = WorkflowDefinition::new("capped", "only")
        .step(
            "only",
            Step::task(|_| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!("done"))
            })
            .end(),
        )
        .inline()
        .max_concurrent(1);
    h.workflows.register(def).unwrap();
    h.workflows.register(trivial_def("other")).unwrap();

    h.workflows.start("capped", json!({})).await.unwrap();
    let err = h.workflows.start("capped", json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::ConcurrencyLimit { ref scope, .. } if scope == "capped"));

    // The cap is per definition, not global.
    h.workflows.start("other", json!({})).await.unwrap();
}

#[tokio::test]
async fn isolated_start_refuses_non_serializable_services() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(WorkflowsConfig {
        isolation: Some(isolation(dir.path())),
        ..Default::default()
    });

    // Isolated definition (the default).
    let def = WorkflowDefinition::new("iso", "only").step("only", Step::pass(json!(1)).end());
    h.workflows.register(def).unwrap();
    h.workflows
        .services()
        .register_opaque("live-socket", Arc::new(42u32));

    let err = h.workflows.start("iso", json!({})).await.unwrap_err();
    assert!(
        matches!(err, EngineError::NonSerializableConfig(ref name) if name == "live-socket")
    );

    // No record was persisted for the refused start.
    assert_eq!(h.store.count_running(None).await.unwrap(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn isolated_start_spawns_executor_and_tracks_watchdog_meta() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(WorkflowsConfig {
        isolation: Some(isolation(dir.path())),
        ..Default::default()
    });

    let def = WorkflowDefinition::new("iso", "only").step("only", Step::pass(json!(1)).end());
    h.workflows.register(def).unwrap();

    // Capture the bootstrap line the executor would read from stdin.
    let captured = Arc::new(parking_lot::Mutex::new(None::<String>));
    let captured_in_spawn = Arc::clone(&captured);
    h.spawner.on_spawn(move |child| {
        *captured_in_spawn.lock() = child.spec.stdin_line.clone();
        std::mem::forget(child.exit);
    });

    let id = h.workflows.start("iso", json!({"k": 1})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bootstrap: serde_json::Value =
        serde_json::from_str(captured.lock().as_ref().unwrap()).unwrap();
    assert_eq!(bootstrap["workflowName"], "iso");
    assert_eq!(bootstrap["instanceId"], id.as_str());
    assert!(bootstrap["socketPath"].as_str().unwrap().contains("wfl_"));
    assert!(bootstrap["dbPath"].as_str().unwrap().ends_with("core.db"));

    let instance = h.workflows.get(id.as_str()).await.unwrap().unwrap();
    let meta = instance.watchdog_meta().unwrap();
    assert!(meta.pid >= 40_000);
}

#[tokio::test]
async fn cancel_pending_or_missing() {
    let h = harness(WorkflowsConfig::default());
    assert!(!h.workflows.cancel("wfi-nope").await.unwrap());

    h.workflows.register(trivial_def("simple")).unwrap();
    let id = h.workflows.start("simple", json!({})).await.unwrap();
    wait_for_status(&h, id.as_str(), WorkflowStatus::Completed).await;
    // Terminal instances cannot be cancelled.
    assert!(!h.workflows.cancel(id.as_str()).await.unwrap());
}
