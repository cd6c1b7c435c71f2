// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow definitions: a named start step plus a step table.
//!
//! Step handlers are plain Rust callables registered in code; definitions
//! are therefore not serialized. The isolated executor relies on the
//! embedding application registering the same definitions in the runner
//! binary (compiled-in, where the source system loaded modules by path).

use super::context::StepContext;
use dl_core::RetryPolicy;
use indexmap::IndexMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Error raised by a task handler or poll check.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StepError(pub String);

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for StepError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StepError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

pub type TaskFn = Arc<dyn Fn(StepContext) -> BoxFuture<Result<Value, StepError>> + Send + Sync>;
pub type CheckFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<Result<PollOutcome, StepError>> + Send + Sync>;
pub type PredicateFn = Arc<dyn Fn(&StepContext) -> bool + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(&StepContext) -> Value + Send + Sync>;
pub type ValidateFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// What a poll check reported.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub done: bool,
    pub result: Option<Value>,
}

impl PollOutcome {
    pub fn done(result: Value) -> Self {
        Self { done: true, result: Some(result) }
    }

    pub fn pending() -> Self {
        Self { done: false, result: None }
    }
}

/// Where a task's work actually runs.
#[derive(Clone)]
pub enum TaskKind {
    /// In-process callable.
    Handler(TaskFn),
    /// Delegate to the jobs engine under this handler name.
    Job(String),
}

/// Failure handling for parallel branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelErrorMode {
    /// Abort siblings on the first rejection (default).
    #[default]
    FailFast,
    /// Let every branch finish, then aggregate rejections.
    WaitAll,
}

/// One predicate → next-step rule of a choice step.
#[derive(Clone)]
pub struct ChoiceRule {
    pub when: PredicateFn,
    pub next: String,
}

/// Step behavior variants.
#[derive(Clone)]
pub enum StepKind {
    Task {
        task: TaskKind,
        input_validate: Option<ValidateFn>,
        output_validate: Option<ValidateFn>,
    },
    Parallel {
        branches: IndexMap<String, Arc<WorkflowDefinition>>,
        on_error: ParallelErrorMode,
    },
    Choice {
        rules: Vec<ChoiceRule>,
        default: Option<String>,
    },
    Pass {
        result: Option<Value>,
        transform: Option<TransformFn>,
    },
    Poll {
        check: CheckFn,
        interval: Duration,
        timeout: Option<Duration>,
        max_polls: Option<u32>,
    },
    Loop {
        when: PredicateFn,
        target: String,
        max_iterations: u32,
        timeout: Option<Duration>,
    },
}

/// One step of a definition.
#[derive(Clone)]
pub struct Step {
    pub kind: StepKind,
    pub next: Option<String>,
    pub end: bool,
    pub retry: Option<RetryPolicy>,
}

impl Step {
    fn with_kind(kind: StepKind) -> Self {
        Self { kind, next: None, end: false, retry: None }
    }

    /// Task running an in-process handler.
    pub fn task<F, Fut>(handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self::with_kind(StepKind::Task {
            task: TaskKind::Handler(Arc::new(move |ctx| Box::pin(handler(ctx)))),
            input_validate: None,
            output_validate: None,
        })
    }

    /// Task delegating to a registered job handler.
    pub fn task_job(job_name: impl Into<String>) -> Self {
        Self::with_kind(StepKind::Task {
            task: TaskKind::Job(job_name.into()),
            input_validate: None,
            output_validate: None,
        })
    }

    /// Parallel fan-out over named branch definitions.
    pub fn parallel(
        branches: impl IntoIterator<Item = (&'static str, WorkflowDefinition)>,
    ) -> Self {
        Self::with_kind(StepKind::Parallel {
            branches: branches
                .into_iter()
                .map(|(name, def)| (name.to_string(), Arc::new(def)))
                .collect(),
            on_error: ParallelErrorMode::default(),
        })
    }

    /// First matching predicate wins.
    pub fn choice(rules: impl IntoIterator<Item = (PredicateFn, &'static str)>) -> Self {
        Self::with_kind(StepKind::Choice {
            rules: rules
                .into_iter()
                .map(|(when, next)| ChoiceRule { when, next: next.to_string() })
                .collect(),
            default: None,
        })
    }

    /// Literal result.
    pub fn pass(result: Value) -> Self {
        Self::with_kind(StepKind::Pass { result: Some(result), transform: None })
    }

    /// Result computed from the context.
    pub fn pass_transform<F>(transform: F) -> Self
    where
        F: Fn(&StepContext) -> Value + Send + Sync + 'static,
    {
        Self::with_kind(StepKind::Pass { result: None, transform: Some(Arc::new(transform)) })
    }

    /// Invoke `check` on an interval until it reports done.
    pub fn poll<F, Fut>(check: F, interval: Duration) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PollOutcome, StepError>> + Send + 'static,
    {
        Self::with_kind(StepKind::Poll {
            check: Arc::new(move |ctx| Box::pin(check(ctx))),
            interval,
            timeout: None,
            max_polls: None,
        })
    }

    /// Jump back to `target` while the predicate holds.
    pub fn repeat<F>(when: F, target: impl Into<String>) -> Self
    where
        F: Fn(&StepContext) -> bool + Send + Sync + 'static,
    {
        Self::with_kind(StepKind::Loop {
            when: Arc::new(when),
            target: target.into(),
            max_iterations: 100,
            timeout: None,
        })
    }

    // -- common knobs -------------------------------------------------------

    pub fn next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn end(mut self) -> Self {
        self.end = true;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    // -- variant knobs (no effect on other variants) ------------------------

    pub fn validate_input<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        if let StepKind::Task { ref mut input_validate, .. } = self.kind {
            *input_validate = Some(Arc::new(validator));
        }
        self
    }

    pub fn validate_output<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        if let StepKind::Task { ref mut output_validate, .. } = self.kind {
            *output_validate = Some(Arc::new(validator));
        }
        self
    }

    pub fn wait_all(mut self) -> Self {
        if let StepKind::Parallel { ref mut on_error, .. } = self.kind {
            *on_error = ParallelErrorMode::WaitAll;
        }
        self
    }

    pub fn default_to(mut self, step: impl Into<String>) -> Self {
        if let StepKind::Choice { ref mut default, .. } = self.kind {
            *default = Some(step.into());
        }
        self
    }

    pub fn poll_timeout(mut self, duration: Duration) -> Self {
        if let StepKind::Poll { ref mut timeout, .. } = self.kind {
            *timeout = Some(duration);
        }
        self
    }

    pub fn max_polls(mut self, n: u32) -> Self {
        if let StepKind::Poll { ref mut max_polls, .. } = self.kind {
            *max_polls = Some(n);
        }
        self
    }

    pub fn max_iterations(mut self, n: u32) -> Self {
        if let StepKind::Loop { ref mut max_iterations, .. } = self.kind {
            *max_iterations = n;
        }
        self
    }

    pub fn loop_timeout(mut self, duration: Duration) -> Self {
        if let StepKind::Loop { ref mut timeout, .. } = self.kind {
            *timeout = Some(duration);
        }
        self
    }
}

/// Convenience for building choice rules without spelling the Arc type.
pub fn when<F>(predicate: F) -> PredicateFn
where
    F: Fn(&StepContext) -> bool + Send + Sync + 'static,
{
    Arc::new(predicate)
}

/// A named workflow: start step, step table, and execution policy.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub start: String,
    pub steps: IndexMap<String, Step>,
    pub default_retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    /// Run the state machine in a subprocess executor. On by default;
    /// effective only when the engine has isolation configured.
    pub isolated: bool,
    pub max_concurrent: Option<usize>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, start: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: start.into(),
            steps: IndexMap::new(),
            default_retry: None,
            timeout: None,
            isolated: true,
            max_concurrent: None,
        }
    }

    pub fn step(mut self, name: impl Into<String>, step: Step) -> Self {
        self.steps.insert(name.into(), step);
        self
    }

    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = Some(policy);
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Run inline on the parent's event loop instead of a subprocess.
    pub fn inline(mut self) -> Self {
        self.isolated = false;
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = Some(n);
        self
    }
}

#[cfg(test)]
#[path = "definition_tests.rs"]
mod tests;
