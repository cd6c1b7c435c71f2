// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Definition and service registries.
//!
//! Services are a dynamic name → instance map with explicit registration.
//! Each entry tracks whether its config is JSON-serializable: isolated
//! workflows refuse to start while a non-serializable service is
//! registered, because the executor subprocess rebuilds its services from
//! the serialized configs.

use super::definition::WorkflowDefinition;
use crate::error::EngineError;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

struct ServiceEntry {
    service: Arc<dyn Any + Send + Sync>,
    config: Option<Value>,
    serializable: bool,
}

/// Dynamic name → service map shared with step contexts.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: Mutex<HashMap<String, ServiceEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service without config.
    pub fn register<T: Any + Send + Sync>(&self, name: &str, service: Arc<T>) {
        self.entries.lock().insert(
            name.to_string(),
            ServiceEntry { service, config: None, serializable: true },
        );
    }

    /// Register a service whose config crosses the subprocess boundary.
    pub fn register_with_config<T: Any + Send + Sync>(
        &self,
        name: &str,
        service: Arc<T>,
        config: Value,
    ) {
        self.entries.lock().insert(
            name.to_string(),
            ServiceEntry { service, config: Some(config), serializable: true },
        );
    }

    /// Register an already-erased service (plugin factories in the
    /// isolated executor produce these).
    pub fn register_boxed(
        &self,
        name: &str,
        service: Arc<dyn Any + Send + Sync>,
        config: Option<Value>,
    ) {
        self.entries.lock().insert(
            name.to_string(),
            ServiceEntry { service, config, serializable: true },
        );
    }

    /// Register a service that cannot be reconstructed in a subprocess
    /// (live connections, callbacks). Blocks isolated workflows.
    pub fn register_opaque<T: Any + Send + Sync>(&self, name: &str, service: Arc<T>) {
        self.entries.lock().insert(
            name.to_string(),
            ServiceEntry { service, config: None, serializable: false },
        );
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let entries = self.entries.lock();
        let entry = entries.get(name)?;
        Arc::clone(&entry.service).downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// The first registered service that cannot cross a process boundary.
    pub fn first_non_serializable(&self) -> Option<String> {
        self.entries
            .lock()
            .iter()
            .find(|(_, entry)| !entry.serializable)
            .map(|(name, _)| name.clone())
    }

    /// `(name, config)` pairs for the executor bootstrap line.
    pub fn serializable_configs(&self) -> Vec<(String, Option<Value>)> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.serializable)
            .map(|(name, entry)| (name.clone(), entry.config.clone()))
            .collect()
    }
}

/// Name → definition map.
#[derive(Default)]
pub struct WorkflowRegistry {
    defs: Mutex<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: WorkflowDefinition) -> Result<(), EngineError> {
        let mut defs = self.defs.lock();
        if defs.contains_key(&def.name) {
            return Err(EngineError::AlreadyRegistered(def.name));
        }
        defs.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.defs.lock().get(name).cloned()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
