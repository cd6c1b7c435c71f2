// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The workflow state machine: an iterative driver over `current_step`.
//!
//! One driver owns one instance's mutations for the whole run (the record
//! is single-writer). Progress is persisted after every step, so a restart
//! resumes from the step dictated by the last completed step's `next`,
//! never re-running it.

use super::context::StepContext;
use super::definition::{
    ParallelErrorMode, PollOutcome, Step, StepKind, TaskKind, WorkflowDefinition,
};
use super::observer::WorkflowObserver;
use super::registry::ServiceRegistry;
use async_trait::async_trait;
use dl_core::{
    Clock, EventBus, InstanceUpdate, StepResult, StepState, SystemClock, WorkflowInstance,
    WorkflowStatus,
};
use dl_storage::{StorageError, WorkflowStore};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("instance {0:?} not found")]
    InstanceNotFound(String),

    #[error("step {step:?} not found")]
    StepNotFound { step: String },

    #[error("step {step:?} failed: {error}")]
    StepFailed { step: String, error: String },

    #[error("workflow cancelled")]
    Cancelled,

    #[error("workflow timed out")]
    TimedOut,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Runs jobs on behalf of `Step::task_job` steps.
#[async_trait]
pub trait JobDelegate: Send + Sync {
    async fn run_job(&self, name: &str, payload: Value) -> Result<Value, String>;
}

#[async_trait]
impl<C: Clock> JobDelegate for crate::jobs::Jobs<C> {
    async fn run_job(&self, name: &str, payload: Value) -> Result<Value, String> {
        let id = self
            .enqueue(name, payload, crate::jobs::EnqueueOpts::default())
            .await
            .map_err(|e| e.to_string())?;
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let Some(job) = self.get(id.as_str()).await.map_err(|e| e.to_string())? else {
                return Err(format!("job {id} disappeared"));
            };
            match job.status {
                dl_core::JobStatus::Completed => {
                    return Ok(job.result.unwrap_or(Value::Null));
                }
                dl_core::JobStatus::Failed => {
                    return Err(job.last_error.unwrap_or_else(|| "job failed".to_string()));
                }
                _ => {}
            }
        }
    }
}

/// What one step execution produced.
struct StepSuccess {
    output: Value,
    /// `Some(next)` when the step dictates control flow (choice, loop).
    next_override: Option<Option<String>>,
}

/// Why one step execution failed.
struct ExecFailure {
    error: String,
    /// Whether the step retry policy applies (task and poll failures).
    retryable: bool,
}

impl ExecFailure {
    fn retryable(error: impl Into<String>) -> Self {
        Self { error: error.into(), retryable: true }
    }

    fn terminal(error: impl Into<String>) -> Self {
        Self { error: error.into(), retryable: false }
    }
}

pub struct StateMachine<C: Clock = SystemClock> {
    store: Arc<dyn WorkflowStore>,
    events: EventBus,
    services: Arc<ServiceRegistry>,
    observer: Arc<dyn WorkflowObserver>,
    jobs: Mutex<Option<Arc<dyn JobDelegate>>>,
    cancels: Mutex<HashSet<String>>,
    clock: C,
}

impl<C: Clock> StateMachine<C> {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        events: EventBus,
        services: Arc<ServiceRegistry>,
        observer: Arc<dyn WorkflowObserver>,
        clock: C,
    ) -> Self {
        Self {
            store,
            events,
            services,
            observer,
            jobs: Mutex::new(None),
            cancels: Mutex::new(HashSet::new()),
            clock,
        }
    }

    /// Wire the jobs engine for `Step::task_job` delegation.
    pub fn set_job_delegate(&self, delegate: Arc<dyn JobDelegate>) {
        *self.jobs.lock() = Some(delegate);
    }

    /// Set the cooperative cancellation flag. The driver reads (and
    /// clears) it between steps.
    pub fn request_cancel(&self, id: &str) {
        self.cancels.lock().insert(id.to_string());
    }

    fn take_cancel(&self, id: &str) -> bool {
        self.cancels.lock().remove(id)
    }

    /// Boxed entry point; breaks the async type cycle for parallel
    /// branches spawning nested runs.
    pub fn run_boxed(
        self: Arc<Self>,
        id: String,
        def: Arc<WorkflowDefinition>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, MachineError>> + Send>> {
        Box::pin(async move { self.run(&id, def).await })
    }

    /// Drive one instance to a terminal state.
    pub async fn run(
        self: &Arc<Self>,
        id: &str,
        def: Arc<WorkflowDefinition>,
    ) -> Result<Value, MachineError> {
        let mut instance = self.load(id).await?;
        if instance.status == WorkflowStatus::Pending {
            let now = self.clock.now_utc();
            self.store
                .update(
                    id,
                    InstanceUpdate::new()
                        .status(WorkflowStatus::Running)
                        .started_at(Some(now)),
                )
                .await?;
            instance.status = WorkflowStatus::Running;
            instance.started_at = Some(now);
        }

        let run_started = self.clock.now();
        let mut prev = Value::Null;

        while let Some(step_name) = instance.current_step.clone() {
            if self.take_cancel(id) {
                info!(instance_id = id, "workflow cancelled between steps");
                self.store
                    .update(
                        id,
                        InstanceUpdate::new()
                            .status(WorkflowStatus::Cancelled)
                            .completed_at(Some(self.clock.now_utc())),
                    )
                    .await?;
                return Err(MachineError::Cancelled);
            }

            if let Some(timeout) = def.timeout {
                if self.clock.now().saturating_duration_since(run_started) > timeout {
                    warn!(instance_id = id, "workflow timed out");
                    self.store
                        .update(
                            id,
                            InstanceUpdate::new()
                                .status(WorkflowStatus::TimedOut)
                                .error(Some("Workflow timed out".to_string()))
                                .completed_at(Some(self.clock.now_utc())),
                        )
                        .await?;
                    instance = self.load(id).await?;
                    self.observer.on_failed(&instance, "Workflow timed out");
                    return Err(MachineError::TimedOut);
                }
            }

            let Some(step) = def.steps.get(&step_name) else {
                let error = format!("step {step_name:?} not found");
                self.fail_instance(id, &step_name, &error, false).await?;
                return Err(MachineError::StepNotFound { step: step_name });
            };

            // Reload to observe externally written metadata / counters.
            instance = self.load(id).await?;

            // Advance the step result, preserving running counters.
            let now = self.clock.now_utc();
            let mut results = instance.step_results.clone();
            let entry = results.entry(step_name.clone()).or_insert_with(StepResult::default);
            entry.status = StepState::Running;
            entry.attempts += 1;
            if entry.started_at.is_none() {
                entry.started_at = Some(now);
            }
            entry.input = Some(instance.input.clone());
            let attempts = entry.attempts;

            self.store
                .update(
                    id,
                    InstanceUpdate::new()
                        .step_results(results.clone())
                        .current_step(Some(step_name.clone())),
                )
                .await?;
            instance.step_results = results;
            instance.current_step = Some(step_name.clone());

            self.observer.on_step_started(&instance, &step_name);
            debug!(instance_id = id, step = %step_name, attempts, "step started");

            let ctx = StepContext::new(
                instance.input.clone(),
                instance.completed_outputs(),
                prev.clone(),
                instance.id.clone(),
                instance.workflow_name.clone(),
                instance.metadata.clone(),
                Arc::clone(&self.services),
                self.events.clone(),
                Arc::clone(&self.store),
            );

            match self.execute_step(&instance, &step_name, step, ctx).await {
                Ok(StepSuccess { output, next_override }) => {
                    // Reload first: poll/loop counters were persisted
                    // during execution.
                    instance = self.load(id).await?;
                    let now = self.clock.now_utc();
                    let mut results = instance.step_results.clone();
                    let entry =
                        results.entry(step_name.clone()).or_insert_with(StepResult::default);
                    entry.status = StepState::Completed;
                    entry.output = Some(output.clone());
                    entry.completed_at = Some(now);
                    entry.error = None;

                    let completed = results
                        .values()
                        .filter(|r| r.status == StepState::Completed)
                        .count();
                    let total = def.steps.len().max(1);
                    let percent = ((completed * 100) as f64 / total as f64).round() as u32;

                    let next = match next_override {
                        Some(next) => next,
                        None if step.end => None,
                        None => step.next.clone(),
                    };

                    self.store
                        .update(
                            id,
                            InstanceUpdate::new()
                                .step_results(results.clone())
                                .current_step(next.clone()),
                        )
                        .await?;
                    instance.step_results = results;
                    instance.current_step = next;

                    self.observer.on_step_completed(&instance, &step_name, &output);
                    self.observer.on_progress(&instance, percent);
                    debug!(instance_id = id, step = %step_name, percent, "step completed");

                    prev = output;
                }
                Err(failure) => {
                    let policy = step.retry.or(def.default_retry);
                    if failure.retryable {
                        if let Some(policy) = policy {
                            if policy.allows_retry(attempts) {
                                let delay = policy.delay(attempts);
                                debug!(
                                    instance_id = id,
                                    step = %step_name,
                                    attempts,
                                    delay_ms = delay.as_millis() as u64,
                                    error = %failure.error,
                                    "step failed, retrying"
                                );
                                tokio::time::sleep(delay).await;
                                // Same step, next attempt.
                                continue;
                            }
                        }
                    }

                    self.fail_instance(id, &step_name, &failure.error, true).await?;
                    return Err(MachineError::StepFailed {
                        step: step_name,
                        error: failure.error,
                    });
                }
            }
        }

        // Natural exit.
        let now = self.clock.now_utc();
        self.store
            .update(
                id,
                InstanceUpdate::new()
                    .status(WorkflowStatus::Completed)
                    .output(Some(prev.clone()))
                    .completed_at(Some(now)),
            )
            .await?;
        instance = self.load(id).await?;
        self.observer.on_completed(&instance, &prev);
        info!(instance_id = id, workflow = %instance.workflow_name, "workflow completed");
        Ok(prev)
    }

    async fn load(&self, id: &str) -> Result<WorkflowInstance, MachineError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| MachineError::InstanceNotFound(id.to_string()))
    }

    /// Mark the step (optionally) and the instance failed, emit observers.
    async fn fail_instance(
        &self,
        id: &str,
        step_name: &str,
        error: &str,
        step_failed: bool,
    ) -> Result<(), MachineError> {
        let now = self.clock.now_utc();
        let mut instance = self.load(id).await?;

        if step_failed {
            let entry = instance
                .step_results
                .entry(step_name.to_string())
                .or_insert_with(StepResult::default);
            entry.status = StepState::Failed;
            entry.error = Some(error.to_string());
            entry.completed_at = Some(now);
        }

        self.store
            .update(
                id,
                InstanceUpdate::new()
                    .step_results(instance.step_results.clone())
                    .status(WorkflowStatus::Failed)
                    .error(Some(error.to_string()))
                    .completed_at(Some(now)),
            )
            .await?;
        instance.status = WorkflowStatus::Failed;
        instance.error = Some(error.to_string());

        if step_failed {
            self.observer.on_step_failed(&instance, step_name, error);
        }
        self.observer.on_failed(&instance, error);
        warn!(instance_id = id, step = step_name, error, "workflow failed");
        Ok(())
    }

    async fn execute_step(
        self: &Arc<Self>,
        instance: &WorkflowInstance,
        step_name: &str,
        step: &Step,
        ctx: StepContext,
    ) -> Result<StepSuccess, ExecFailure> {
        match &step.kind {
            StepKind::Task { task, input_validate, output_validate } => {
                if let Some(validate) = input_validate {
                    validate(&ctx.input)
                        .map_err(|e| ExecFailure::retryable(format!("input validation failed: {e}")))?;
                }
                let output = match task {
                    TaskKind::Handler(handler) => handler(ctx)
                        .await
                        .map_err(|e| ExecFailure::retryable(e.0))?,
                    TaskKind::Job(job_name) => {
                        let delegate = self.jobs.lock().clone();
                        let Some(delegate) = delegate else {
                            return Err(ExecFailure::terminal(format!(
                                "step delegates to job {job_name:?} but no jobs engine is wired"
                            )));
                        };
                        delegate
                            .run_job(job_name, ctx.input.clone())
                            .await
                            .map_err(ExecFailure::retryable)?
                    }
                };
                if let Some(validate) = output_validate {
                    validate(&output).map_err(|e| {
                        ExecFailure::retryable(format!("output validation failed: {e}"))
                    })?;
                }
                Ok(StepSuccess { output, next_override: None })
            }

            StepKind::Pass { result, transform } => {
                let output = match (result, transform) {
                    (Some(value), _) => value.clone(),
                    (None, Some(transform)) => transform(&ctx),
                    (None, None) => Value::Null,
                };
                Ok(StepSuccess { output, next_override: None })
            }

            StepKind::Choice { rules, default } => {
                for rule in rules {
                    if (rule.when)(&ctx) {
                        return Ok(StepSuccess {
                            output: json!({ "chosen": rule.next }),
                            next_override: Some(Some(rule.next.clone())),
                        });
                    }
                }
                match default {
                    Some(next) => Ok(StepSuccess {
                        output: json!({ "chosen": next }),
                        next_override: Some(Some(next.clone())),
                    }),
                    None => Err(ExecFailure::terminal("no choice rule matched")),
                }
            }

            StepKind::Poll { check, interval, timeout, max_polls } => {
                self.execute_poll(instance, step_name, check, *interval, *timeout, *max_polls, ctx)
                    .await
            }

            StepKind::Loop { when, target, max_iterations, timeout } => {
                self.execute_loop(instance, step_name, when, target, *max_iterations, *timeout, &ctx)
                    .await
            }

            StepKind::Parallel { branches, on_error } => {
                self.execute_parallel(instance, step_name, branches, *on_error)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_poll(
        self: &Arc<Self>,
        instance: &WorkflowInstance,
        step_name: &str,
        check: &super::definition::CheckFn,
        interval: std::time::Duration,
        timeout: Option<std::time::Duration>,
        max_polls: Option<u32>,
        ctx: StepContext,
    ) -> Result<StepSuccess, ExecFailure> {
        let id = instance.id.as_str();
        let poll_started = self.clock.now();
        let mut polls = instance
            .step_results
            .get(step_name)
            .and_then(|r| r.poll_count)
            .unwrap_or(0);

        loop {
            polls += 1;
            self.bump_counter(id, step_name, |entry, now| {
                entry.poll_count = Some(polls);
                entry.last_polled_at = Some(now);
            })
            .await;
            if let Ok(Some(current)) = self.store.get(id).await {
                self.observer.on_step_poll(&current, step_name, polls);
            }

            let outcome = check(ctx.clone())
                .await
                .map_err(|e| ExecFailure::retryable(e.0))?;
            if outcome.done {
                return Ok(StepSuccess {
                    output: outcome.result.unwrap_or(Value::Null),
                    next_override: None,
                });
            }

            if let Some(max) = max_polls {
                if polls >= max {
                    return Err(ExecFailure::retryable(format!(
                        "poll gave up after {polls} checks"
                    )));
                }
            }
            if let Some(timeout) = timeout {
                if self.clock.now().saturating_duration_since(poll_started) >= timeout {
                    return Err(ExecFailure::retryable("poll timed out"));
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_loop(
        &self,
        instance: &WorkflowInstance,
        step_name: &str,
        when: &super::definition::PredicateFn,
        target: &str,
        max_iterations: u32,
        timeout: Option<std::time::Duration>,
        ctx: &StepContext,
    ) -> Result<StepSuccess, ExecFailure> {
        let id = instance.id.as_str();
        let result = instance.step_results.get(step_name);
        let loops = result.and_then(|r| r.loop_count).unwrap_or(0);

        if let (Some(timeout), Some(started)) = (timeout, result.and_then(|r| r.started_at)) {
            let elapsed = self.clock.now_utc().signed_duration_since(started);
            if elapsed.num_milliseconds() as u128 >= timeout.as_millis() {
                return Err(ExecFailure::terminal("loop timed out"));
            }
        }

        if when(ctx) {
            let loops = loops + 1;
            if loops > max_iterations {
                return Err(ExecFailure::terminal(format!(
                    "loop exceeded {max_iterations} iterations"
                )));
            }
            self.bump_counter(id, step_name, |entry, now| {
                entry.loop_count = Some(loops);
                entry.last_looped_at = Some(now);
            })
            .await;
            if let Ok(Some(current)) = self.store.get(id).await {
                self.observer.on_step_loop(&current, step_name, loops);
            }
            Ok(StepSuccess {
                output: json!({ "loopTo": target }),
                next_override: Some(Some(target.to_string())),
            })
        } else {
            Ok(StepSuccess {
                output: json!({ "loopTo": Value::Null }),
                next_override: None,
            })
        }
    }

    async fn execute_parallel(
        self: &Arc<Self>,
        instance: &WorkflowInstance,
        step_name: &str,
        branches: &indexmap::IndexMap<String, Arc<WorkflowDefinition>>,
        on_error: ParallelErrorMode,
    ) -> Result<StepSuccess, ExecFailure> {
        let id = instance.id.as_str();
        let now = self.clock.now_utc();

        // Create one sub-instance per branch, all with the parent's input.
        let mut spawned: Vec<(String, dl_core::InstanceId)> = Vec::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Result<Value, String>)>();

        for (branch_name, branch_def) in branches {
            let mut sub = WorkflowInstance::new(
                format!("{}.{}", instance.workflow_name, branch_name),
                branch_def.start.clone(),
                instance.input.clone(),
                now,
            );
            sub.parent_id = Some(instance.id.clone());
            sub.branch_name = Some(branch_name.clone());
            if let Err(e) = self.store.create(&sub).await {
                return Err(ExecFailure::terminal(format!("branch setup failed: {e}")));
            }
            spawned.push((branch_name.clone(), sub.id.clone()));

            let machine = Arc::clone(self);
            let branch_def = Arc::clone(branch_def);
            let tx = tx.clone();
            let sub_id = sub.id.to_string();
            let branch_name = branch_name.clone();
            tokio::spawn(async move {
                let result = machine
                    .run_boxed(sub_id, branch_def)
                    .await
                    .map_err(|e| e.to_string());
                let _ = tx.send((branch_name, result));
            });
        }
        drop(tx);

        // Link the children on the parent record.
        let mut branch_instances = self.store.get(id).await.ok().flatten()
            .map(|i| i.branch_instances)
            .unwrap_or_default();
        branch_instances.insert(
            step_name.to_string(),
            spawned.iter().map(|(_, id)| id.clone()).collect(),
        );
        let _ = self
            .store
            .update(id, InstanceUpdate::new().branch_instances(branch_instances))
            .await;

        let mut outputs = Map::new();
        let mut errors: Vec<String> = Vec::new();
        let mut cancelled_rest = false;

        while let Some((branch_name, result)) = rx.recv().await {
            match result {
                Ok(output) => {
                    outputs.insert(branch_name, output);
                }
                Err(error) => {
                    errors.push(format!("{branch_name}: {error}"));
                    if on_error == ParallelErrorMode::FailFast && !cancelled_rest {
                        cancelled_rest = true;
                        for (other, sub_id) in &spawned {
                            if *other != branch_name && !outputs.contains_key(other) {
                                self.request_cancel(sub_id.as_str());
                            }
                        }
                    }
                }
            }
        }

        if let Some(first) = errors.first() {
            let error = match on_error {
                ParallelErrorMode::FailFast => first.clone(),
                ParallelErrorMode::WaitAll => errors.join("; "),
            };
            return Err(ExecFailure::terminal(error));
        }

        Ok(StepSuccess {
            output: Value::Object(outputs),
            next_override: None,
        })
    }

    /// Persist one counter mutation on a step result.
    async fn bump_counter<F>(&self, id: &str, step_name: &str, mutate: F)
    where
        F: FnOnce(&mut StepResult, chrono::DateTime<chrono::Utc>),
    {
        let Ok(Some(instance)) = self.store.get(id).await else {
            return;
        };
        let mut results = instance.step_results;
        let entry = results
            .entry(step_name.to_string())
            .or_insert_with(StepResult::default);
        mutate(entry, self.clock.now_utc());
        let _ = self
            .store
            .update(id, InstanceUpdate::new().step_results(results))
            .await;
    }
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
