// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow instance record: the durable state of one run of a workflow
//! definition, including per-step results (the state machine's cursor).

use crate::id::InstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::TimedOut
        )
    }
}

crate::simple_display! {
    WorkflowStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
        TimedOut => "timed_out",
    }
}

/// Status of a single step within an instance.
///
/// Step results are monotone: once `Completed` or `Failed`, a step never
/// returns to `Running` within the same instance run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
}

crate::simple_display! {
    StepState {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
}

/// Persisted result of one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepResult {
    pub status: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_looped_at: Option<DateTime<Utc>>,
}

impl Default for StepState {
    fn default() -> Self {
        StepState::Pending
    }
}

/// Watchdog hints for an isolated (subprocess) workflow, kept under the
/// reserved `__watchdog` metadata key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WatchdogMeta {
    pub pid: u32,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: DateTime<Utc>,
}

/// Reserved metadata key for [`WatchdogMeta`].
pub const WATCHDOG_META_KEY: &str = "__watchdog";

/// One run of a named workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub step_results: HashMap<String, StepResult>,
    /// parallel-step-name → child instance ids
    #[serde(default)]
    pub branch_instances: HashMap<String, Vec<InstanceId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<InstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    /// Free-form metadata; `__watchdog` is reserved.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(
        workflow_name: impl Into<String>,
        start_step: impl Into<String>,
        input: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            workflow_name: workflow_name.into(),
            status: WorkflowStatus::Pending,
            current_step: Some(start_step.into()),
            input,
            output: None,
            error: None,
            step_results: HashMap::new(),
            branch_instances: HashMap::new(),
            parent_id: None,
            branch_name: None,
            metadata: Map::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Read the reserved `__watchdog` metadata sub-object.
    pub fn watchdog_meta(&self) -> Option<WatchdogMeta> {
        self.metadata
            .get(WATCHDOG_META_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Write the reserved `__watchdog` metadata sub-object.
    pub fn set_watchdog_meta(&mut self, meta: WatchdogMeta) {
        if let Ok(v) = serde_json::to_value(meta) {
            self.metadata.insert(WATCHDOG_META_KEY.to_string(), v);
        }
    }

    /// Completed-output view of step results, keyed by step name.
    pub fn completed_outputs(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for (name, result) in &self.step_results {
            if result.status == StepState::Completed {
                out.insert(name.clone(), result.output.clone().unwrap_or(Value::Null));
            }
        }
        out
    }
}

/// Partial update for a workflow instance. Same absent/null convention as
/// [`crate::JobUpdate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub status: Option<WorkflowStatus>,
    pub current_step: Option<Option<String>>,
    pub output: Option<Option<Value>>,
    pub error: Option<Option<String>>,
    pub step_results: Option<HashMap<String, StepResult>>,
    pub branch_instances: Option<HashMap<String, Vec<InstanceId>>>,
    pub metadata: Option<Map<String, Value>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl InstanceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, v: WorkflowStatus) -> Self {
        self.status = Some(v);
        self
    }

    pub fn current_step(mut self, v: Option<String>) -> Self {
        self.current_step = Some(v);
        self
    }

    pub fn output(mut self, v: Option<Value>) -> Self {
        self.output = Some(v);
        self
    }

    pub fn error(mut self, v: Option<String>) -> Self {
        self.error = Some(v);
        self
    }

    pub fn step_results(mut self, v: HashMap<String, StepResult>) -> Self {
        self.step_results = Some(v);
        self
    }

    pub fn branch_instances(mut self, v: HashMap<String, Vec<InstanceId>>) -> Self {
        self.branch_instances = Some(v);
        self
    }

    pub fn metadata(mut self, v: Map<String, Value>) -> Self {
        self.metadata = Some(v);
        self
    }

    pub fn started_at(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(v);
        self
    }

    pub fn completed_at(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.completed_at = Some(v);
        self
    }

    pub fn apply(&self, instance: &mut WorkflowInstance) {
        if let Some(v) = self.status {
            instance.status = v;
        }
        if let Some(ref v) = self.current_step {
            instance.current_step = v.clone();
        }
        if let Some(ref v) = self.output {
            instance.output = v.clone();
        }
        if let Some(ref v) = self.error {
            instance.error = v.clone();
        }
        if let Some(ref v) = self.step_results {
            instance.step_results = v.clone();
        }
        if let Some(ref v) = self.branch_instances {
            instance.branch_instances = v.clone();
        }
        if let Some(ref v) = self.metadata {
            instance.metadata = v.clone();
        }
        if let Some(ref v) = self.started_at {
            instance.started_at = *v;
        }
        if let Some(ref v) = self.completed_at {
            instance.completed_at = *v;
        }
    }
}

crate::builder! {
    pub struct InstanceBuilder => WorkflowInstance {
        into {
            workflow_name: String = "test-flow",
        }
        set {
            id: InstanceId = InstanceId::new(),
            status: WorkflowStatus = WorkflowStatus::Pending,
            input: Value = Value::Null,
            step_results: HashMap<String, StepResult> = HashMap::new(),
            branch_instances: HashMap<String, Vec<InstanceId>> = HashMap::new(),
            metadata: Map<String, Value> = Map::new(),
        }
        option {
            current_step: String = Some("start".to_string()),
            output: Value = None,
            error: String = None,
            parent_id: InstanceId = None,
            branch_name: String = None,
            started_at: DateTime<Utc> = None,
            completed_at: DateTime<Utc> = None,
        }
        computed {
            created_at: DateTime<Utc> = Utc::now(),
        }
    }
}

#[cfg(test)]
#[path = "workflow_tests.rs"]
mod tests;
