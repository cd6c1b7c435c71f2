// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory storage backend.
//!
//! Behavior-compatible with the SQLite backend; used by tests and by the
//! isolated workflow runner for services that do not need durability.

use crate::adapter::{JobStore, ProcessStore, StorageError, WorkflowStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dl_core::{
    InstanceUpdate, Job, JobFilter, JobStatus, JobUpdate, ManagedProcess, ProcStatus, ProcUpdate,
    WorkflowInstance, WorkflowStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Shared<T> {
    records: Mutex<HashMap<String, T>>,
    stopped: AtomicBool,
}

// Manual impl: derive would demand `T: Default` for no reason.
impl<T> Default for Shared<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }
}

impl<T> Shared<T> {
    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// In-memory jobs table.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    shared: Arc<Shared<Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StorageError> {
        if self.shared.stopped() {
            return Ok(());
        }
        self.shared
            .records
            .lock()
            .insert(job.id.to_string(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StorageError> {
        if self.shared.stopped() {
            return Ok(None);
        }
        Ok(self.shared.records.lock().get(id).cloned())
    }

    async fn update(&self, id: &str, update: JobUpdate) -> Result<(), StorageError> {
        if self.shared.stopped() {
            return Ok(());
        }
        if let Some(job) = self.shared.records.lock().get_mut(id) {
            update.apply(job);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        if self.shared.stopped() {
            return Ok(false);
        }
        Ok(self.shared.records.lock().remove(id).is_some())
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        if self.shared.stopped() {
            return Ok(false);
        }
        let mut records = self.shared.records.lock();
        match records.get_mut(id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut jobs: Vec<Job> = self
            .shared
            .records
            .lock()
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn get_by_name(
        &self,
        name: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut jobs: Vec<Job> = self
            .shared
            .records
            .lock()
            .values()
            .filter(|j| j.name == name && status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn get_scheduled_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut jobs: Vec<Job> = self
            .shared
            .records
            .lock()
            .values()
            .filter(|j| {
                j.status == JobStatus::Scheduled && j.run_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.run_at);
        Ok(jobs)
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<Job>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut jobs: Vec<Job> = self
            .shared
            .records
            .lock()
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn get_running_external(&self) -> Result<Vec<Job>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut jobs: Vec<Job> = self
            .shared
            .records
            .lock()
            .values()
            .filter(|j| j.status == JobStatus::Running && j.external)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn get_all(&self, filter: JobFilter) -> Result<Vec<Job>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut jobs: Vec<Job> = self
            .shared
            .records
            .lock()
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        if self.shared.stopped() {
            return Ok(0);
        }
        let mut records = self.shared.records.lock();
        let before = records.len();
        records.retain(|_, j| {
            !(j.is_terminal() && j.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - records.len()) as u64)
    }

    async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}

/// In-memory workflow instances table.
#[derive(Clone, Default)]
pub struct MemoryWorkflowStore {
    shared: Arc<Shared<WorkflowInstance>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StorageError> {
        if self.shared.stopped() {
            return Ok(());
        }
        self.shared
            .records
            .lock()
            .insert(instance.id.to_string(), instance.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<WorkflowInstance>, StorageError> {
        if self.shared.stopped() {
            return Ok(None);
        }
        Ok(self.shared.records.lock().get(id).cloned())
    }

    async fn update(&self, id: &str, update: InstanceUpdate) -> Result<(), StorageError> {
        if self.shared.stopped() {
            return Ok(());
        }
        if let Some(instance) = self.shared.records.lock().get_mut(id) {
            update.apply(instance);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        if self.shared.stopped() {
            return Ok(false);
        }
        Ok(self.shared.records.lock().remove(id).is_some())
    }

    async fn get_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut instances: Vec<WorkflowInstance> = self
            .shared
            .records
            .lock()
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn get_by_name(
        &self,
        workflow_name: &str,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut instances: Vec<WorkflowInstance> = self
            .shared
            .records
            .lock()
            .values()
            .filter(|i| {
                i.workflow_name == workflow_name && status.is_none_or(|s| i.status == s)
            })
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn get_running(&self) -> Result<Vec<WorkflowInstance>, StorageError> {
        self.get_by_status(WorkflowStatus::Running).await
    }

    async fn count_running(&self, workflow_name: Option<&str>) -> Result<usize, StorageError> {
        if self.shared.stopped() {
            return Ok(0);
        }
        Ok(self
            .shared
            .records
            .lock()
            .values()
            .filter(|i| {
                matches!(i.status, WorkflowStatus::Pending | WorkflowStatus::Running)
                    && workflow_name.is_none_or(|n| i.workflow_name == n)
            })
            .count())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        if self.shared.stopped() {
            return Ok(0);
        }
        let mut records = self.shared.records.lock();
        let before = records.len();
        records.retain(|_, i| {
            !(i.is_terminal() && i.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - records.len()) as u64)
    }

    async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}

/// In-memory managed processes table.
#[derive(Clone, Default)]
pub struct MemoryProcessStore {
    shared: Arc<Shared<ManagedProcess>>,
}

impl MemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStore for MemoryProcessStore {
    async fn create(&self, proc: &ManagedProcess) -> Result<(), StorageError> {
        if self.shared.stopped() {
            return Ok(());
        }
        self.shared
            .records
            .lock()
            .insert(proc.id.to_string(), proc.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ManagedProcess>, StorageError> {
        if self.shared.stopped() {
            return Ok(None);
        }
        Ok(self.shared.records.lock().get(id).cloned())
    }

    async fn update(&self, id: &str, update: ProcUpdate) -> Result<(), StorageError> {
        if self.shared.stopped() {
            return Ok(());
        }
        if let Some(proc) = self.shared.records.lock().get_mut(id) {
            update.apply(proc);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        if self.shared.stopped() {
            return Ok(false);
        }
        Ok(self.shared.records.lock().remove(id).is_some())
    }

    async fn get_by_status(&self, status: ProcStatus) -> Result<Vec<ManagedProcess>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut procs: Vec<ManagedProcess> = self
            .shared
            .records
            .lock()
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        procs.sort_by_key(|p| p.created_at);
        Ok(procs)
    }

    async fn get_by_name(&self, name: &str) -> Result<Vec<ManagedProcess>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut procs: Vec<ManagedProcess> = self
            .shared
            .records
            .lock()
            .values()
            .filter(|p| p.name == name)
            .cloned()
            .collect();
        procs.sort_by_key(|p| p.created_at);
        Ok(procs)
    }

    async fn get_running(&self) -> Result<Vec<ManagedProcess>, StorageError> {
        self.get_by_status(ProcStatus::Running).await
    }

    async fn get_orphaned(&self) -> Result<Vec<ManagedProcess>, StorageError> {
        self.get_by_status(ProcStatus::Orphaned).await
    }

    async fn get_all(&self) -> Result<Vec<ManagedProcess>, StorageError> {
        if self.shared.stopped() {
            return Ok(Vec::new());
        }
        let mut procs: Vec<ManagedProcess> =
            self.shared.records.lock().values().cloned().collect();
        procs.sort_by_key(|p| p.created_at);
        Ok(procs)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        if self.shared.stopped() {
            return Ok(0);
        }
        let mut records = self.shared.records.lock();
        let before = records.len();
        records.retain(|_, p| {
            !(p.is_terminal() && p.stopped_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - records.len()) as u64)
    }

    async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
