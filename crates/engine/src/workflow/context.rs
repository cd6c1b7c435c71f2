// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution context handed to step handlers.

use super::registry::ServiceRegistry;
use dl_core::{EventBus, InstanceId};
use dl_ipc::LogLevel;
use dl_storage::{StorageError, WorkflowStore};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a step handler can see and do.
///
/// `steps` holds the outputs of completed steps; `prev` is the previous
/// step's output (Null for the first step). Metadata writes persist
/// immediately so an externally observed instance (watchdog, queries)
/// never lags.
#[derive(Clone)]
pub struct StepContext {
    pub input: Value,
    pub steps: Map<String, Value>,
    pub prev: Value,
    pub instance_id: InstanceId,
    pub workflow_name: String,
    metadata: Map<String, Value>,
    services: Arc<ServiceRegistry>,
    events: EventBus,
    store: Arc<dyn WorkflowStore>,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        input: Value,
        steps: Map<String, Value>,
        prev: Value,
        instance_id: InstanceId,
        workflow_name: String,
        metadata: Map<String, Value>,
        services: Arc<ServiceRegistry>,
        events: EventBus,
        store: Arc<dyn WorkflowStore>,
    ) -> Self {
        Self {
            input,
            steps,
            prev,
            instance_id,
            workflow_name,
            metadata,
            services,
            events,
            store,
        }
    }

    /// Publish an application event on `workflow.<name>.event` and
    /// `workflow.<id>.event`.
    pub fn emit(&self, payload: Value) {
        self.events.publish(
            &format!("workflow.{}.event", self.workflow_name),
            payload.clone(),
        );
        self.events
            .publish(&format!("workflow.{}.event", self.instance_id), payload);
    }

    /// Structured log line attributed to this instance.
    pub fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => {
                debug!(instance_id = %self.instance_id, workflow = %self.workflow_name, "{message}")
            }
            LogLevel::Info => {
                info!(instance_id = %self.instance_id, workflow = %self.workflow_name, "{message}")
            }
            LogLevel::Warn => {
                warn!(instance_id = %self.instance_id, workflow = %self.workflow_name, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(instance_id = %self.instance_id, workflow = %self.workflow_name, "{message}")
            }
        }
        self.events.publish(
            "workflow.log",
            json!({
                "instanceId": self.instance_id.as_str(),
                "level": level,
                "message": message,
            }),
        );
    }

    /// Snapshot of the instance metadata as of step start.
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Persist one metadata key. Reads the live record first so keys
    /// written by others (the watchdog's `__watchdog`) survive.
    pub async fn set_metadata(&mut self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut merged = match self.store.get(self.instance_id.as_str()).await? {
            Some(instance) => instance.metadata,
            None => self.metadata.clone(),
        };
        merged.insert(key.to_string(), value);
        self.store
            .update(
                self.instance_id.as_str(),
                dl_core::InstanceUpdate::new().metadata(merged.clone()),
            )
            .await?;
        self.metadata = merged;
        Ok(())
    }

    /// Look up a registered service by name and concrete type.
    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services.get::<T>(name)
    }
}
