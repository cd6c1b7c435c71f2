// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::memory::{MemoryJobStore, MemoryProcessStore, MemoryWorkflowStore};
use crate::JobStore;
use chrono::Utc;
use dl_core::{FakeClock, Job, JobStatus};
use serde_json::json;

#[tokio::test]
async fn sweep_removes_only_expired_terminal_jobs() {
    let jobs = MemoryJobStore::new();
    let workflows = MemoryWorkflowStore::new();
    let processes = MemoryProcessStore::new();

    let clock = FakeClock::new();
    clock.set_epoch_ms(Utc::now().timestamp_millis() as u64);
    let now = clock.now_utc();

    let mut expired = Job::new("expired", json!({}), 3, now - ChronoDuration::days(60));
    expired.status = JobStatus::Completed;
    expired.completed_at = Some(now - ChronoDuration::days(60));
    jobs.create(&expired).await.unwrap();

    let mut recent = Job::new("recent", json!({}), 3, now);
    recent.status = JobStatus::Failed;
    recent.completed_at = Some(now - ChronoDuration::days(1));
    jobs.create(&recent).await.unwrap();

    let live = Job::new("live", json!({}), 3, now);
    jobs.create(&live).await.unwrap();

    sweep(
        &jobs,
        &workflows,
        &processes,
        &clock,
        &CleanupConfig::default(),
    )
    .await;

    assert!(jobs.get(expired.id.as_str()).await.unwrap().is_none());
    assert!(jobs.get(recent.id.as_str()).await.unwrap().is_some());
    assert!(jobs.get(live.id.as_str()).await.unwrap().is_some());
}

#[tokio::test]
async fn sweep_tolerates_missing_tables() {
    // A pool with no schema bootstrapped: the jobs table does not exist.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(sqlx::sqlite::SqliteConnectOptions::new().in_memory(true))
        .await
        .unwrap();
    let bare = crate::sqlite::SqliteJobStore::open(pool.clone()).await.unwrap();
    sqlx::raw_sql("DROP TABLE jobs")
        .execute(&pool)
        .await
        .unwrap();

    let clock = FakeClock::new();
    clock.set_epoch_ms(Utc::now().timestamp_millis() as u64);

    // Must not panic or propagate the error.
    sweep(
        &bare,
        &MemoryWorkflowStore::new(),
        &MemoryProcessStore::new(),
        &clock,
        &CleanupConfig::default(),
    )
    .await;
}

#[tokio::test]
async fn task_spawns_and_stops_cleanly() {
    let task = CleanupTask::spawn(
        Arc::new(MemoryJobStore::new()),
        Arc::new(MemoryWorkflowStore::new()),
        Arc::new(MemoryProcessStore::new()),
        CleanupConfig {
            interval: Duration::from_millis(10),
            retention_days: 30,
        },
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    task.stop().await;
}
