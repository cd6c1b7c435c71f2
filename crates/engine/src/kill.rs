// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Graceful kill escalation, shared by the engines and the watchdog.

use crate::spawner::{KillSignal, Spawner};
use std::time::Duration;
use tracing::debug;

/// What the escalation observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// SIGTERM could not be delivered; the pid was already gone.
    AlreadyGone,
    /// The child exited within the grace window.
    ExitedOnTerm,
    /// SIGKILL was delivered.
    Killed,
}

/// SIGTERM, wait `grace_ms`, SIGKILL if the pid is still alive.
///
/// `grace_ms == 0` skips the wait and goes straight to SIGKILL.
pub async fn escalate(spawner: &dyn Spawner, pid: u32, grace_ms: u64) -> KillOutcome {
    if spawner.kill(pid, KillSignal::Term).is_err() {
        debug!(pid, "SIGTERM failed, pid already gone");
        return KillOutcome::AlreadyGone;
    }

    if grace_ms == 0 {
        let _ = spawner.kill(pid, KillSignal::Kill);
        return KillOutcome::Killed;
    }

    tokio::time::sleep(Duration::from_millis(grace_ms)).await;
    if spawner.is_alive(pid) {
        let _ = spawner.kill(pid, KillSignal::Kill);
        KillOutcome::Killed
    } else {
        KillOutcome::ExitedOnTerm
    }
}

#[cfg(test)]
#[path = "kill_tests.rs"]
mod tests;
