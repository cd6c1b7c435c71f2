// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution engines over the persistence layer: background jobs, managed
//! processes, durable workflows, and the watchdog that polices all three.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod error;
pub mod env;
mod jobs;
mod kill;
mod router;
mod spawner;
mod supervisor;
mod watchdog;
mod workflow;

#[cfg(any(test, feature = "test-support"))]
mod fake_spawner;

pub use error::EngineError;
pub use jobs::{
    EnqueueOpts, ExternalJobConfig, ExternalKillPolicy, HandlerError, JobContext, JobHandler,
    Jobs, JobsConfig,
};
pub use kill::{escalate, KillOutcome};
pub use spawner::{KillSignal, OsSpawner, SpawnError, SpawnSpec, SpawnedChild, Spawner};
pub use supervisor::Supervisor;
pub use watchdog::{Watchdog, WatchdogBuilder, WatchdogConfig};
pub use workflow::{
    when, ChoiceRule, EventObserver, IsolationConfig, JobDelegate, MachineError,
    ParallelErrorMode, PollOutcome, PredicateFn, ServiceRegistry, StateMachine, Step, StepContext,
    StepError, StepKind, TaskKind, WorkflowDefinition, WorkflowObserver, WorkflowRegistry,
    Workflows, WorkflowsConfig,
};

#[cfg(any(test, feature = "test-support"))]
pub use fake_spawner::{FakeChild, FakeSpawner};
