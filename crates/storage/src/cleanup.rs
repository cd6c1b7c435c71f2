// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retention sweeper for terminal records.
//!
//! Deletes completed/failed rows older than the retention window on a fixed
//! interval. Live records are never touched (the stores' terminal-only
//! DELETE guarantees that). "No such table" is tolerated: the sweeper may
//! fire during the boot window before a store has bootstrapped its schema.

use crate::adapter::{JobStore, ProcessStore, StorageError, WorkflowStore};
use chrono::Duration as ChronoDuration;
use dl_core::{Clock, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Sweep interval and retention window.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub retention_days: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            retention_days: 30,
        }
    }
}

/// Periodic cleanup over all three tables.
pub struct CleanupTask {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupTask {
    /// Spawn the sweeper. It runs until [`CleanupTask::stop`] is called.
    pub fn spawn(
        jobs: Arc<dyn JobStore>,
        workflows: Arc<dyn WorkflowStore>,
        processes: Arc<dyn ProcessStore>,
        config: CleanupConfig,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let notify = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            let clock = SystemClock;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(config.interval) => {
                        sweep(&*jobs, &*workflows, &*processes, &clock, &config).await;
                    }
                    _ = notify.notified() => break,
                }
            }
        });
        Self { shutdown, handle: Some(handle) }
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// One pass over all three stores.
pub(crate) async fn sweep(
    jobs: &dyn JobStore,
    workflows: &dyn WorkflowStore,
    processes: &dyn ProcessStore,
    clock: &impl Clock,
    config: &CleanupConfig,
) {
    let cutoff = clock.now_utc() - ChronoDuration::days(config.retention_days);

    for (table, result) in [
        ("jobs", jobs.delete_terminal_before(cutoff).await),
        ("workflow_instances", workflows.delete_terminal_before(cutoff).await),
        ("managed_processes", processes.delete_terminal_before(cutoff).await),
    ] {
        match result {
            Ok(0) => {}
            Ok(n) => tracing::debug!(table, removed = n, "retention sweep"),
            Err(ref e) if is_missing_table(e) => {
                // Boot window: migrations have not created the table yet.
                tracing::debug!(table, "retention sweep skipped, table missing");
            }
            Err(e) => tracing::warn!(table, error = %e, "retention sweep failed"),
        }
    }
}

fn is_missing_table(err: &StorageError) -> bool {
    match err {
        StorageError::Database(sqlx::Error::Database(db)) => {
            db.message().contains("no such table")
        }
        _ => false,
    }
}

#[cfg(test)]
#[path = "cleanup_tests.rs"]
mod tests;
