// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    spawning = { ProcStatus::Spawning, false },
    running = { ProcStatus::Running, false },
    orphaned = { ProcStatus::Orphaned, false },
    crashed = { ProcStatus::Crashed, false },
    stopped = { ProcStatus::Stopped, true },
    dead = { ProcStatus::Dead, true },
)]
fn terminal_statuses(status: ProcStatus, terminal: bool) {
    assert_eq!(status.is_terminal(), terminal);
}

#[test]
fn spec_builder_defaults() {
    let spec = ProcessSpec::new("worker");
    assert_eq!(spec.heartbeat_timeout_ms, 30_000);
    assert_eq!(spec.max_consecutive_failures, 3);
    assert_eq!(spec.kill_grace_ms, 5_000);
    assert_eq!(spec.restart, RestartPolicy::OnFailure);
    assert!(spec.max_runtime_ms.is_none());
}

#[test]
fn spec_builder_chains() {
    let spec = ProcessSpec::new("worker")
        .args(["--queue", "high"])
        .env("RUST_LOG", "info")
        .cwd("/srv/app")
        .heartbeat_timeout_ms(10_000)
        .max_runtime_ms(3_600_000)
        .restart(RestartPolicy::Always)
        .max_consecutive_failures(5)
        .kill_grace_ms(0);

    assert_eq!(spec.args, vec!["--queue", "high"]);
    assert_eq!(spec.env, vec![("RUST_LOG".to_string(), "info".to_string())]);
    assert_eq!(spec.max_runtime_ms, Some(3_600_000));
    assert_eq!(spec.kill_grace_ms, 0);
}

#[test]
fn restart_policy_wire_names() {
    assert_eq!(serde_json::to_string(&RestartPolicy::OnFailure).unwrap(), "\"on-failure\"");
    assert_eq!(serde_json::to_string(&RestartPolicy::Never).unwrap(), "\"never\"");
    let parsed: RestartPolicy = serde_json::from_str("\"always\"").unwrap();
    assert_eq!(parsed, RestartPolicy::Always);
}

#[test]
fn new_process_starts_spawning() {
    let proc = ManagedProcess::new("indexer", ProcessSpec::new("indexer-bin"), chrono::Utc::now());
    assert_eq!(proc.status, ProcStatus::Spawning);
    assert_eq!(proc.consecutive_failures, 0);
    assert!(proc.pid.is_none());
    assert!(proc.id.as_str().starts_with("prc-"));
}

#[test]
fn update_clear_vs_absent() {
    let mut proc = ManagedProcess::builder().pid(99u32).error("crash").build();

    ProcUpdate::new().status(ProcStatus::Running).apply(&mut proc);
    assert_eq!(proc.pid, Some(99));
    assert_eq!(proc.error.as_deref(), Some("crash"));

    ProcUpdate::new().pid(None).error(None).apply(&mut proc);
    assert_eq!(proc.pid, None);
    assert_eq!(proc.error, None);
}

#[test]
fn process_serde_round_trip() {
    let proc = ManagedProcess::builder()
        .name("metrics-agent")
        .status(ProcStatus::Running)
        .pid(1234u32)
        .build();

    let json = serde_json::to_string(&proc).unwrap();
    let parsed: ManagedProcess = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, proc);
}
