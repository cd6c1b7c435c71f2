// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::workflow::definition::{when, Step, StepError, WorkflowDefinition};
use crate::workflow::observer::EventObserver;
use crate::workflow::registry::ServiceRegistry;
use dl_core::{FakeClock, RetryPolicy};
use dl_storage::MemoryWorkflowStore;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

struct Harness {
    machine: Arc<StateMachine<FakeClock>>,
    store: Arc<MemoryWorkflowStore>,
    events: EventBus,
    clock: FakeClock,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryWorkflowStore::new());
    let events = EventBus::new();
    let clock = FakeClock::new();
    let machine = Arc::new(StateMachine::new(
        Arc::clone(&store) as Arc<dyn WorkflowStore>,
        events.clone(),
        Arc::new(ServiceRegistry::new()),
        Arc::new(EventObserver::new(events.clone())),
        clock.clone(),
    ));
    Harness { machine, store, events, clock }
}

async fn start_instance(h: &Harness, def: &WorkflowDefinition, input: Value) -> String {
    let instance = WorkflowInstance::new(&def.name, &def.start, input, h.clock.now_utc());
    h.store.create(&instance).await.unwrap();
    instance.id.to_string()
}

#[tokio::test]
async fn sequential_tasks_thread_prev_through() {
    let h = harness();
    let def = WorkflowDefinition::new("math", "double")
        .step(
            "double",
            Step::task(|ctx| async move {
                let n = ctx.input["n"].as_i64().unwrap_or(0);
                Ok(json!({ "n": n * 2 }))
            })
            .next("add-one"),
        )
        .step(
            "add-one",
            Step::task(|ctx| async move {
                let n = ctx.prev["n"].as_i64().unwrap_or(0);
                Ok(json!({ "n": n + 1 }))
            })
            .end(),
        );

    let id = start_instance(&h, &def, json!({"n": 5})).await;
    let output = h.machine.run(&id, Arc::new(def)).await.unwrap();
    assert_eq!(output, json!({"n": 11}));

    let instance = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.output, Some(json!({"n": 11})));
    assert_eq!(instance.current_step, None);
    assert!(instance.started_at.is_some());
    assert!(instance.completed_at.is_some());
    assert_eq!(instance.step_results["double"].status, StepState::Completed);
    assert_eq!(instance.step_results["add-one"].attempts, 1);
}

#[tokio::test]
async fn choice_routes_on_prev_output() {
    // S4 shape: A → choice → C (D never runs).
    let h = harness();
    let def = WorkflowDefinition::new("branching", "a")
        .step("a", Step::task(|_| async { Ok(json!({"n": 1})) }).next("b"))
        .step(
            "b",
            Step::choice([
                (when(|ctx| ctx.prev["n"] == 1), "c"),
                (when(|ctx| ctx.prev["n"] == 2), "d"),
            ]),
        )
        .step("c", Step::task(|_| async { Ok(json!({"done": true})) }).end())
        .step("d", Step::task(|_| async { Ok(json!({"done": false})) }).end());

    let id = start_instance(&h, &def, json!({})).await;
    let output = h.machine.run(&id, Arc::new(def)).await.unwrap();
    assert_eq!(output, json!({"done": true}));

    let instance = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.step_results["b"].output, Some(json!({"chosen": "c"})));
    assert!(instance.step_results.contains_key("c"));
    assert!(!instance.step_results.contains_key("d"));
}

#[tokio::test]
async fn choice_without_match_or_default_fails() {
    let h = harness();
    let def = WorkflowDefinition::new("dead-end", "pick")
        .step("pick", Step::choice([(when(|_| false), "never")]));

    let id = start_instance(&h, &def, json!({})).await;
    let err = h.machine.run(&id, Arc::new(def)).await.unwrap_err();
    assert!(matches!(err, MachineError::StepFailed { .. }));

    let instance = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.error.unwrap().contains("no choice rule matched"));
}

#[tokio::test]
async fn choice_default_applies() {
    let h = harness();
    let def = WorkflowDefinition::new("fallback", "pick")
        .step("pick", Step::choice([(when(|_| false), "never")]).default_to("done"))
        .step("done", Step::pass(json!("ok")).end());

    let id = start_instance(&h, &def, json!({})).await;
    let output = h.machine.run(&id, Arc::new(def)).await.unwrap();
    assert_eq!(output, json!("ok"));
}

#[tokio::test]
async fn task_retry_honors_policy_then_fails_terminally() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_step = Arc::clone(&calls);
    let def = WorkflowDefinition::new("retrying", "work").step(
        "work",
        Step::task(move |_| {
            let calls = Arc::clone(&calls_in_step);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StepError::new("always broken"))
            }
        })
        .retry(RetryPolicy {
            max_attempts: 3,
            interval_ms: 5,
            backoff_rate: 1.0,
            max_interval_ms: 50,
        })
        .end(),
    );

    let id = start_instance(&h, &def, json!({})).await;
    let err = h.machine.run(&id, Arc::new(def)).await.unwrap_err();
    assert!(matches!(err, MachineError::StepFailed { ref step, .. } if step == "work"));

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let instance = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert_eq!(instance.step_results["work"].attempts, 3);
    assert_eq!(instance.step_results["work"].status, StepState::Failed);
    assert!(instance.error.unwrap().contains("always broken"));
}

#[tokio::test]
async fn task_retry_recovers_mid_policy() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_step = Arc::clone(&calls);
    let def = WorkflowDefinition::new("flaky", "work")
        .default_retry(RetryPolicy {
            max_attempts: 5,
            interval_ms: 5,
            backoff_rate: 1.0,
            max_interval_ms: 50,
        })
        .step(
            "work",
            Step::task(move |_| {
                let calls = Arc::clone(&calls_in_step);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StepError::new("transient"))
                    } else {
                        Ok(json!("finally"))
                    }
                }
            })
            .end(),
        );

    let id = start_instance(&h, &def, json!({})).await;
    let output = h.machine.run(&id, Arc::new(def)).await.unwrap();
    assert_eq!(output, json!("finally"));

    let instance = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(instance.step_results["work"].attempts, 3);
    assert_eq!(instance.step_results["work"].status, StepState::Completed);
}

#[tokio::test]
async fn validation_failures_are_retryable_step_failures() {
    let h = harness();
    let def = WorkflowDefinition::new("strict", "work").step(
        "work",
        Step::task(|_| async { Ok(json!("not an object")) })
            .validate_input(|v| {
                if v.get("required").is_some() {
                    Ok(())
                } else {
                    Err("missing required".to_string())
                }
            })
            .end(),
    );

    let id = start_instance(&h, &def, json!({})).await;
    let err = h.machine.run(&id, Arc::new(def)).await.unwrap_err();
    match err {
        MachineError::StepFailed { error, .. } => {
            assert!(error.contains("input validation failed"));
            assert!(error.contains("missing required"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn pass_literal_and_transform() {
    let h = harness();
    let def = WorkflowDefinition::new("passing", "fixed")
        .step("fixed", Step::pass(json!({"a": 1})).next("derived"))
        .step(
            "derived",
            Step::pass_transform(|ctx| json!({"prev_a": ctx.prev["a"]})).end(),
        );

    let id = start_instance(&h, &def, json!({})).await;
    let output = h.machine.run(&id, Arc::new(def)).await.unwrap();
    assert_eq!(output, json!({"prev_a": 1}));
}

#[tokio::test]
async fn poll_counts_every_check_until_done() {
    let h = harness();
    let polls = Arc::new(AtomicU32::new(0));
    let polls_in_step = Arc::clone(&polls);
    let def = WorkflowDefinition::new("poller", "wait").step(
        "wait",
        Step::poll(
            move |_| {
                let polls = Arc::clone(&polls_in_step);
                async move {
                    if polls.fetch_add(1, Ordering::SeqCst) >= 2 {
                        Ok(PollOutcome::done(json!({"ready": true})))
                    } else {
                        Ok(PollOutcome::pending())
                    }
                }
            },
            Duration::from_millis(5),
        )
        .end(),
    );

    let id = start_instance(&h, &def, json!({})).await;
    let output = h.machine.run(&id, Arc::new(def)).await.unwrap();
    assert_eq!(output, json!({"ready": true}));

    let instance = h.store.get(&id).await.unwrap().unwrap();
    let result = &instance.step_results["wait"];
    assert_eq!(result.poll_count, Some(3));
    assert!(result.last_polled_at.is_some());
}

#[tokio::test]
async fn poll_gives_up_after_max_polls() {
    let h = harness();
    let def = WorkflowDefinition::new("stuck-poller", "wait").step(
        "wait",
        Step::poll(|_| async { Ok(PollOutcome::pending()) }, Duration::from_millis(2))
            .max_polls(4)
            .end(),
    );

    let id = start_instance(&h, &def, json!({})).await;
    let err = h.machine.run(&id, Arc::new(def)).await.unwrap_err();
    match err {
        MachineError::StepFailed { error, .. } => assert!(error.contains("gave up after 4")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn loop_jumps_back_until_predicate_clears() {
    let h = harness();
    let counter = Arc::new(AtomicU32::new(0));
    let counter_in_step = Arc::clone(&counter);
    let def = WorkflowDefinition::new("looper", "work")
        .step(
            "work",
            Step::task(move |_| {
                let counter = Arc::clone(&counter_in_step);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(json!({"count": n}))
                }
            })
            .next("again?"),
        )
        .step(
            "again?",
            Step::repeat(|ctx| ctx.prev["count"].as_u64().unwrap_or(0) < 3, "work").next("done"),
        )
        .step("done", Step::pass_transform(|ctx| ctx.steps["work"].clone()).end());

    let id = start_instance(&h, &def, json!({})).await;
    let output = h.machine.run(&id, Arc::new(def)).await.unwrap();
    assert_eq!(output, json!({"count": 3}));

    let instance = h.store.get(&id).await.unwrap().unwrap();
    let result = &instance.step_results["again?"];
    assert_eq!(result.loop_count, Some(2));
    assert!(result.last_looped_at.is_some());
}

#[tokio::test]
async fn loop_enforces_max_iterations() {
    let h = harness();
    let def = WorkflowDefinition::new("infinite", "work")
        .step("work", Step::pass(json!({})).next("again?"))
        .step("again?", Step::repeat(|_| true, "work").max_iterations(3).next("done"))
        .step("done", Step::pass(json!("never")).end());

    let id = start_instance(&h, &def, json!({})).await;
    let err = h.machine.run(&id, Arc::new(def)).await.unwrap_err();
    match err {
        MachineError::StepFailed { error, .. } => {
            assert!(error.contains("exceeded 3 iterations"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn parallel_fail_fast_cancels_slow_branch() {
    // S5 shape: P sleeps then returns, Q throws immediately.
    let h = harness();
    let slow = WorkflowDefinition::new("slow", "p").step(
        "p",
        Step::task(|_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!("p"))
        })
        .end(),
    );
    let boom = WorkflowDefinition::new("boom", "q")
        .step("q", Step::task(|_| async { Err(StepError::new("boom")) }).end());

    let def = WorkflowDefinition::new("fan-out", "split")
        .step("split", Step::parallel([("p", slow), ("q", boom)]).end());

    let id = start_instance(&h, &def, json!({})).await;
    let err = h.machine.run(&id, Arc::new(def)).await.unwrap_err();
    assert!(matches!(err, MachineError::StepFailed { .. }));

    let instance = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Failed);
    assert!(instance.error.as_ref().unwrap().contains("boom"));

    // Both sub-instances exist and are linked.
    let children = &instance.branch_instances["split"];
    assert_eq!(children.len(), 2);
    let mut statuses = Vec::new();
    for child_id in children {
        let child = h.store.get(child_id.as_str()).await.unwrap().unwrap();
        assert_eq!(child.parent_id, Some(instance.id.clone()));
        statuses.push((child.branch_name.clone().unwrap(), child.status));
    }
    let q_status = statuses.iter().find(|(n, _)| n == "q").unwrap().1;
    assert_eq!(q_status, WorkflowStatus::Failed);
    let p_status = statuses.iter().find(|(n, _)| n == "p").unwrap().1;
    assert!(
        p_status == WorkflowStatus::Completed || p_status == WorkflowStatus::Cancelled,
        "unexpected branch status {p_status}"
    );
}

#[tokio::test]
async fn parallel_success_maps_branch_outputs() {
    let h = harness();
    let left = WorkflowDefinition::new("left", "s")
        .step("s", Step::pass(json!("left-output")).end());
    let right = WorkflowDefinition::new("right", "s")
        .step("s", Step::pass(json!("right-output")).end());

    let def = WorkflowDefinition::new("fan-out", "split")
        .step("split", Step::parallel([("left", left), ("right", right)]).end());

    let id = start_instance(&h, &def, json!({"shared": 1})).await;
    let output = h.machine.run(&id, Arc::new(def)).await.unwrap();
    assert_eq!(
        output,
        json!({"left": "left-output", "right": "right-output"})
    );

    // Branches received the parent's input.
    let instance = h.store.get(&id).await.unwrap().unwrap();
    for child_id in &instance.branch_instances["split"] {
        let child = h.store.get(child_id.as_str()).await.unwrap().unwrap();
        assert_eq!(child.input, json!({"shared": 1}));
    }
}

#[tokio::test]
async fn parallel_wait_all_aggregates_errors() {
    let h = harness();
    let fail_a = WorkflowDefinition::new("fa", "s")
        .step("s", Step::task(|_| async { Err(StepError::new("first")) }).end());
    let fail_b = WorkflowDefinition::new("fb", "s")
        .step("s", Step::task(|_| async { Err(StepError::new("second")) }).end());

    let def = WorkflowDefinition::new("fan-out", "split").step(
        "split",
        Step::parallel([("a", fail_a), ("b", fail_b)]).wait_all().end(),
    );

    let id = start_instance(&h, &def, json!({})).await;
    let err = h.machine.run(&id, Arc::new(def)).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("first"));
    assert!(message.contains("second"));
}

#[tokio::test]
async fn cancellation_flag_stops_between_steps_and_clears() {
    let h = harness();
    let second_ran = Arc::new(AtomicU32::new(0));
    let second_ran_in_step = Arc::clone(&second_ran);
    let machine = Arc::clone(&h.machine);

    let def = WorkflowDefinition::new("cancellable", "first")
        .step(
            "first",
            Step::task(move |ctx| {
                // Cancel mid-run; observed before the next step starts.
                machine.request_cancel(ctx.instance_id.as_str());
                async { Ok(json!(1)) }
            })
            .next("second"),
        )
        .step(
            "second",
            Step::task(move |_| {
                let ran = Arc::clone(&second_ran_in_step);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(2))
                }
            })
            .end(),
        );

    let id = start_instance(&h, &def, json!({})).await;
    let err = h.machine.run(&id, Arc::new(def.clone())).await.unwrap_err();
    assert!(matches!(err, MachineError::Cancelled));
    assert_eq!(second_ran.load(Ordering::SeqCst), 0);

    let instance = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Cancelled);
    assert!(instance.completed_at.is_some());

    // The flag was consumed: nothing lingers for a later run of this id.
    assert!(!h.machine.take_cancel(&id));
}

#[tokio::test]
async fn resume_after_crash_never_reruns_a_completed_step() {
    // Simulate a parent that died after persisting step a's completion:
    // the record says a is done and the cursor points at b.
    let h = harness();
    let a_runs = Arc::new(AtomicU32::new(0));
    let a_runs_in_step = Arc::clone(&a_runs);
    let def = WorkflowDefinition::new("resumable", "a")
        .step(
            "a",
            Step::task(move |_| {
                let runs = Arc::clone(&a_runs_in_step);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("a-output"))
                }
            })
            .next("b"),
        )
        .step("b", Step::pass_transform(|ctx| ctx.steps["a"].clone()).end());

    let mut instance = WorkflowInstance::new("resumable", "a", json!({}), h.clock.now_utc());
    instance.status = WorkflowStatus::Running;
    instance.started_at = Some(h.clock.now_utc());
    instance.current_step = Some("b".to_string());
    instance.step_results.insert(
        "a".into(),
        StepResult {
            status: StepState::Completed,
            output: Some(json!("a-output")),
            attempts: 1,
            completed_at: Some(h.clock.now_utc()),
            ..Default::default()
        },
    );
    h.store.create(&instance).await.unwrap();

    let output = h
        .machine
        .run(instance.id.as_str(), Arc::new(def))
        .await
        .unwrap();
    assert_eq!(output, json!("a-output"));

    // Step a was never re-executed; its persisted result fed b.
    assert_eq!(a_runs.load(Ordering::SeqCst), 0);
    let instance = h.store.get(instance.id.as_str()).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.step_results["a"].attempts, 1);
    assert_eq!(instance.step_results["b"].status, StepState::Completed);
}

#[tokio::test]
async fn missing_step_fails_the_instance() {
    let h = harness();
    let def = WorkflowDefinition::new("broken", "start")
        .step("start", Step::pass(json!(1)).next("ghost"));

    let id = start_instance(&h, &def, json!({})).await;
    let err = h.machine.run(&id, Arc::new(def)).await.unwrap_err();
    assert!(matches!(err, MachineError::StepNotFound { ref step } if step == "ghost"));

    let instance = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn workflow_events_flow_through_the_fabric() {
    let h = harness();
    let (_, step_rx) = h.events.subscribe_channel("workflow.step.*");
    let (_, done_rx) = h.events.subscribe_channel("workflow.completed");

    let def = WorkflowDefinition::new("observed", "only")
        .step("only", Step::pass(json!("done")).end());

    let id = start_instance(&h, &def, json!({})).await;
    h.machine.run(&id, Arc::new(def)).await.unwrap();

    let started = step_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(started.topic, "workflow.step.started");
    assert_eq!(started.payload["step"], "only");
    let completed = step_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(completed.topic, "workflow.step.completed");

    let done = done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(done.payload["output"], "done");
}

#[tokio::test]
async fn progress_is_rounded_share_of_completed_steps() {
    let h = harness();
    let (_, progress_rx) = h.events.subscribe_channel("workflow.progress");

    let def = WorkflowDefinition::new("thirds", "a")
        .step("a", Step::pass(json!(1)).next("b"))
        .step("b", Step::pass(json!(2)).next("c"))
        .step("c", Step::pass(json!(3)).end());

    let id = start_instance(&h, &def, json!({})).await;
    h.machine.run(&id, Arc::new(def)).await.unwrap();

    let percents: Vec<u64> = (0..3)
        .map(|_| {
            progress_rx
                .recv_timeout(Duration::from_secs(1))
                .unwrap()
                .payload["percent"]
                .as_u64()
                .unwrap()
        })
        .collect();
    assert_eq!(percents, vec![33, 67, 100]);
}
