// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Adapter traits shared by the memory and SQLite backends.
//!
//! Every adapter carries an explicit stopped state. After `stop()`, selects
//! return empty results and mutations are accepted as no-ops: late calls
//! from a draining tick loop are expected during shutdown and must not
//! surface as errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dl_core::{
    InstanceUpdate, Job, JobFilter, JobUpdate, ManagedProcess, ProcStatus, ProcUpdate,
    WorkflowInstance, WorkflowStatus,
};
use thiserror::Error;

/// Errors from a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid stored value for {column}: {message}")]
    Corrupt { column: &'static str, message: String },
}

/// Typed CRUD plus the atomic claim for the jobs table.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StorageError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, StorageError>;

    /// Apply a partial update. Fields absent from the update are untouched.
    /// No-op (Ok) when the row does not exist or the adapter is stopped.
    async fn update(&self, id: &str, update: JobUpdate) -> Result<(), StorageError>;

    /// Returns whether a row existed.
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    /// Atomically transition `pending → running`, recording `started_at`.
    /// Returns false when the job was not in `pending` (someone else won).
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StorageError>;

    async fn get_by_status(&self, status: dl_core::JobStatus) -> Result<Vec<Job>, StorageError>;

    async fn get_by_name(
        &self,
        name: &str,
        status: Option<dl_core::JobStatus>,
    ) -> Result<Vec<Job>, StorageError>;

    /// Jobs with `status = scheduled` and `run_at <= now`, ordered by
    /// `run_at` ascending.
    async fn get_scheduled_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError>;

    /// Pending jobs ordered by `created_at` ascending, up to `limit`.
    async fn get_pending(&self, limit: usize) -> Result<Vec<Job>, StorageError>;

    /// Running external jobs (the reconnect/watchdog working set).
    async fn get_running_external(&self) -> Result<Vec<Job>, StorageError>;

    async fn get_all(&self, filter: JobFilter) -> Result<Vec<Job>, StorageError>;

    /// Delete terminal rows completed before the cutoff. Returns count.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Enter the stopped state. Idempotent.
    async fn stop(&self);
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StorageError>;

    async fn get(&self, id: &str) -> Result<Option<WorkflowInstance>, StorageError>;

    async fn update(&self, id: &str, update: InstanceUpdate) -> Result<(), StorageError>;

    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    async fn get_by_status(&self, status: WorkflowStatus)
        -> Result<Vec<WorkflowInstance>, StorageError>;

    async fn get_by_name(
        &self,
        workflow_name: &str,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, StorageError>;

    async fn get_running(&self) -> Result<Vec<WorkflowInstance>, StorageError>;

    async fn count_running(&self, workflow_name: Option<&str>) -> Result<usize, StorageError>;

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    async fn stop(&self);
}

#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn create(&self, proc: &ManagedProcess) -> Result<(), StorageError>;

    async fn get(&self, id: &str) -> Result<Option<ManagedProcess>, StorageError>;

    async fn update(&self, id: &str, update: ProcUpdate) -> Result<(), StorageError>;

    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    async fn get_by_status(&self, status: ProcStatus) -> Result<Vec<ManagedProcess>, StorageError>;

    async fn get_by_name(&self, name: &str) -> Result<Vec<ManagedProcess>, StorageError>;

    async fn get_running(&self) -> Result<Vec<ManagedProcess>, StorageError>;

    async fn get_orphaned(&self) -> Result<Vec<ManagedProcess>, StorageError>;

    async fn get_all(&self) -> Result<Vec<ManagedProcess>, StorageError>;

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    async fn stop(&self);
}
