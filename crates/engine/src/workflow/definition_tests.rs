// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use dl_core::RetryPolicy;
use serde_json::json;

#[test]
fn definition_builder_defaults() {
    let def = WorkflowDefinition::new("deploy", "build");
    assert_eq!(def.name, "deploy");
    assert_eq!(def.start, "build");
    assert!(def.isolated);
    assert!(def.steps.is_empty());
    assert!(def.max_concurrent.is_none());

    let def = def.inline().max_concurrent(2);
    assert!(!def.isolated);
    assert_eq!(def.max_concurrent, Some(2));
}

#[test]
fn steps_keep_insertion_order() {
    let def = WorkflowDefinition::new("flow", "a")
        .step("a", Step::pass(json!(1)).next("b"))
        .step("b", Step::pass(json!(2)).next("c"))
        .step("c", Step::pass(json!(3)).end());

    let names: Vec<&str> = def.steps.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn task_knobs_apply() {
    let step = Step::task(|_| async { Ok(json!({})) })
        .next("later")
        .retry(RetryPolicy { max_attempts: 5, ..Default::default() })
        .validate_input(|v| {
            if v.is_object() {
                Ok(())
            } else {
                Err("expected object".to_string())
            }
        })
        .validate_output(|_| Ok(()));

    assert_eq!(step.next.as_deref(), Some("later"));
    assert_eq!(step.retry.unwrap().max_attempts, 5);
    match step.kind {
        StepKind::Task { input_validate, output_validate, .. } => {
            assert!(input_validate.is_some());
            assert!(output_validate.is_some());
        }
        _ => panic!("expected task"),
    }
}

#[test]
fn variant_knobs_do_not_leak_across_kinds() {
    // Poll knobs on a pass step are ignored.
    let step = Step::pass(json!(null)).poll_timeout(std::time::Duration::from_secs(1));
    assert!(matches!(step.kind, StepKind::Pass { .. }));

    let step = Step::poll(|_| async { Ok(PollOutcome::pending()) }, std::time::Duration::from_millis(10))
        .poll_timeout(std::time::Duration::from_secs(2))
        .max_polls(7);
    match step.kind {
        StepKind::Poll { timeout, max_polls, .. } => {
            assert_eq!(timeout, Some(std::time::Duration::from_secs(2)));
            assert_eq!(max_polls, Some(7));
        }
        _ => panic!("expected poll"),
    }
}

#[test]
fn choice_rules_and_default() {
    let step = Step::choice([
        (when(|ctx| ctx.prev["n"] == 1), "one"),
        (when(|ctx| ctx.prev["n"] == 2), "two"),
    ])
    .default_to("other");

    match step.kind {
        StepKind::Choice { rules, default } => {
            assert_eq!(rules.len(), 2);
            assert_eq!(rules[0].next, "one");
            assert_eq!(default.as_deref(), Some("other"));
        }
        _ => panic!("expected choice"),
    }
}

#[test]
fn parallel_error_mode() {
    let branch = WorkflowDefinition::new("b", "s").step("s", Step::pass(json!(1)).end());
    let step = Step::parallel([("left", branch.clone()), ("right", branch)]);
    match &step.kind {
        StepKind::Parallel { branches, on_error } => {
            assert_eq!(branches.len(), 2);
            assert_eq!(*on_error, ParallelErrorMode::FailFast);
        }
        _ => panic!("expected parallel"),
    }

    let step = step.wait_all();
    match step.kind {
        StepKind::Parallel { on_error, .. } => assert_eq!(on_error, ParallelErrorMode::WaitAll),
        _ => panic!("expected parallel"),
    }
}

#[test]
fn loop_defaults_are_bounded() {
    let step = Step::repeat(|_| true, "again");
    match step.kind {
        StepKind::Loop { max_iterations, timeout, target, .. } => {
            assert_eq!(max_iterations, 100);
            assert_eq!(target, "again");
            assert!(timeout.is_none());
        }
        _ => panic!("expected loop"),
    }
}
