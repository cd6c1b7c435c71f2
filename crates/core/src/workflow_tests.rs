// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use chrono::TimeZone;
use serde_json::json;
use yare::parameterized;

#[parameterized(
    pending = { WorkflowStatus::Pending, false },
    running = { WorkflowStatus::Running, false },
    completed = { WorkflowStatus::Completed, true },
    failed = { WorkflowStatus::Failed, true },
    cancelled = { WorkflowStatus::Cancelled, true },
    timed_out = { WorkflowStatus::TimedOut, true },
)]
fn terminal_statuses(status: WorkflowStatus, terminal: bool) {
    assert_eq!(status.is_terminal(), terminal);
}

#[test]
fn new_instance_points_at_start_step() {
    let instance = WorkflowInstance::new("deploy", "build", json!({"ref": "main"}), Utc::now());
    assert_eq!(instance.status, WorkflowStatus::Pending);
    assert_eq!(instance.current_step.as_deref(), Some("build"));
    assert!(instance.step_results.is_empty());
    assert!(instance.id.as_str().starts_with("wfi-"));
}

#[test]
fn watchdog_meta_round_trips_through_metadata() {
    let mut instance = WorkflowInstance::builder().build();
    assert!(instance.watchdog_meta().is_none());

    let heartbeat = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
    instance.set_watchdog_meta(WatchdogMeta { pid: 4242, last_heartbeat: heartbeat });

    let meta = instance.watchdog_meta().unwrap();
    assert_eq!(meta.pid, 4242);
    assert_eq!(meta.last_heartbeat, heartbeat);

    // Stored under the reserved key with the wire field name.
    let raw = instance.metadata.get(WATCHDOG_META_KEY).unwrap();
    assert!(raw.get("lastHeartbeat").is_some());
}

#[test]
fn completed_outputs_skips_non_completed_steps() {
    let mut instance = WorkflowInstance::builder().build();
    instance.step_results.insert(
        "a".into(),
        StepResult {
            status: StepState::Completed,
            output: Some(json!({"n": 1})),
            ..Default::default()
        },
    );
    instance.step_results.insert(
        "b".into(),
        StepResult { status: StepState::Running, ..Default::default() },
    );

    let outputs = instance.completed_outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs.get("a"), Some(&json!({"n": 1})));
}

#[test]
fn instance_update_clear_vs_absent() {
    let mut instance = WorkflowInstance::builder()
        .error("step exploded")
        .status(WorkflowStatus::Failed)
        .build();

    InstanceUpdate::new().status(WorkflowStatus::Running).apply(&mut instance);
    assert_eq!(instance.error.as_deref(), Some("step exploded"));

    InstanceUpdate::new()
        .error(None)
        .current_step(None)
        .apply(&mut instance);
    assert_eq!(instance.error, None);
    assert_eq!(instance.current_step, None);
}

#[test]
fn instance_serde_round_trip() {
    let mut instance = WorkflowInstance::builder()
        .workflow_name("etl")
        .input(json!({"rows": 10}))
        .build();
    instance.branch_instances.insert(
        "fan-out".into(),
        vec![InstanceId::from_string("wfi-child1")],
    );

    let json = serde_json::to_string(&instance).unwrap();
    let parsed: WorkflowInstance = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, instance);
}
