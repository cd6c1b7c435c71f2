// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State machine event interface.
//!
//! Inline execution calls the observer directly; isolated execution
//! mirrors the executor's lifecycle frames into the same interface, so
//! consumers cannot tell the two modes apart.

use dl_core::{EventBus, WorkflowInstance};
use serde_json::{json, Value};

pub trait WorkflowObserver: Send + Sync {
    fn on_step_started(&self, _instance: &WorkflowInstance, _step: &str) {}
    fn on_step_completed(&self, _instance: &WorkflowInstance, _step: &str, _output: &Value) {}
    fn on_step_failed(&self, _instance: &WorkflowInstance, _step: &str, _error: &str) {}
    fn on_step_poll(&self, _instance: &WorkflowInstance, _step: &str, _poll_count: u32) {}
    fn on_step_loop(&self, _instance: &WorkflowInstance, _step: &str, _loop_count: u32) {}
    fn on_progress(&self, _instance: &WorkflowInstance, _percent: u32) {}
    fn on_completed(&self, _instance: &WorkflowInstance, _output: &Value) {}
    fn on_failed(&self, _instance: &WorkflowInstance, _error: &str) {}
}

/// Default observer: publishes the lifecycle onto the event fabric, both
/// on the shared topic and a per-workflow-name topic.
pub struct EventObserver {
    events: EventBus,
}

impl EventObserver {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    fn publish(&self, instance: &WorkflowInstance, suffix: &str, payload: Value) {
        self.events
            .publish(&format!("workflow.{suffix}"), payload.clone());
        self.events.publish(
            &format!("workflow.{}.{suffix}", instance.workflow_name),
            payload,
        );
    }
}

impl WorkflowObserver for EventObserver {
    fn on_step_started(&self, instance: &WorkflowInstance, step: &str) {
        self.publish(
            instance,
            "step.started",
            json!({ "instanceId": instance.id.as_str(), "step": step }),
        );
    }

    fn on_step_completed(&self, instance: &WorkflowInstance, step: &str, output: &Value) {
        self.publish(
            instance,
            "step.completed",
            json!({ "instanceId": instance.id.as_str(), "step": step, "output": output }),
        );
    }

    fn on_step_failed(&self, instance: &WorkflowInstance, step: &str, error: &str) {
        self.publish(
            instance,
            "step.failed",
            json!({ "instanceId": instance.id.as_str(), "step": step, "error": error }),
        );
    }

    fn on_step_poll(&self, instance: &WorkflowInstance, step: &str, poll_count: u32) {
        self.publish(
            instance,
            "step.poll",
            json!({ "instanceId": instance.id.as_str(), "step": step, "pollCount": poll_count }),
        );
    }

    fn on_step_loop(&self, instance: &WorkflowInstance, step: &str, loop_count: u32) {
        self.publish(
            instance,
            "step.loop",
            json!({ "instanceId": instance.id.as_str(), "step": step, "loopCount": loop_count }),
        );
    }

    fn on_progress(&self, instance: &WorkflowInstance, percent: u32) {
        self.publish(
            instance,
            "progress",
            json!({ "instanceId": instance.id.as_str(), "percent": percent }),
        );
    }

    fn on_completed(&self, instance: &WorkflowInstance, output: &Value) {
        self.publish(
            instance,
            "completed",
            json!({ "instanceId": instance.id.as_str(), "output": output }),
        );
    }

    fn on_failed(&self, instance: &WorkflowInstance, error: &str) {
        self.publish(
            instance,
            "failed",
            json!({ "instanceId": instance.id.as_str(), "error": error }),
        );
    }
}
