// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::fake_spawner::FakeSpawner;
use crate::spawner::KillSignal;

#[tokio::test]
async fn dead_pid_short_circuits() {
    let spawner = FakeSpawner::new();
    spawner.set_alive(500, false);

    let outcome = escalate(&spawner, 500, 1_000).await;
    assert_eq!(outcome, KillOutcome::AlreadyGone);
    assert_eq!(spawner.kills(), vec![(500, KillSignal::Term)]);
}

#[tokio::test]
async fn zero_grace_goes_straight_to_sigkill() {
    let spawner = FakeSpawner::new();
    spawner.set_alive(501, true);

    let outcome = escalate(&spawner, 501, 0).await;
    assert_eq!(outcome, KillOutcome::Killed);
    assert_eq!(
        spawner.kills(),
        vec![(501, KillSignal::Term), (501, KillSignal::Kill)]
    );
}

#[tokio::test]
async fn stubborn_child_gets_sigkill_after_grace() {
    let spawner = FakeSpawner::new();
    spawner.set_alive(503, true);
    spawner.set_ignores_term(503);

    let outcome = escalate(&spawner, 503, 10).await;
    assert_eq!(outcome, KillOutcome::Killed);
    assert_eq!(
        spawner.kills(),
        vec![(503, KillSignal::Term), (503, KillSignal::Kill)]
    );
}

#[tokio::test]
async fn child_exiting_during_grace_avoids_sigkill() {
    let spawner = FakeSpawner::new();
    spawner.set_alive(502, true);

    // The fake marks the pid dead as soon as SIGTERM lands, so after the
    // grace window the probe sees it gone.
    let outcome = escalate(&spawner, 502, 10).await;
    assert_eq!(outcome, KillOutcome::ExitedOnTerm);
    assert_eq!(spawner.kills(), vec![(502, KillSignal::Term)]);
}
