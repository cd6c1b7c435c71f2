// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::error::EngineError;
use serde_json::json;
use std::sync::Arc;

struct MailService {
    host: String,
}

struct MetricsSink;

#[test]
fn register_and_typed_lookup() {
    let services = ServiceRegistry::new();
    services.register_with_config(
        "mail",
        Arc::new(MailService { host: "smtp.local".into() }),
        json!({"host": "smtp.local"}),
    );
    services.register("metrics", Arc::new(MetricsSink));

    let mail = services.get::<MailService>("mail").unwrap();
    assert_eq!(mail.host, "smtp.local");

    assert!(services.contains("metrics"));
    assert!(!services.contains("missing"));
    assert!(services.get::<MailService>("missing").is_none());
    // Wrong type downcast fails cleanly.
    assert!(services.get::<MetricsSink>("mail").is_none());
}

#[test]
fn serializability_tracking() {
    let services = ServiceRegistry::new();
    services.register("plain", Arc::new(MetricsSink));
    assert!(services.first_non_serializable().is_none());

    services.register_opaque("live-conn", Arc::new(MetricsSink));
    assert_eq!(services.first_non_serializable().as_deref(), Some("live-conn"));

    // Opaque services are excluded from the bootstrap config list.
    let configs = services.serializable_configs();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].0, "plain");
}

#[test]
fn workflow_registry_rejects_duplicates() {
    let registry = WorkflowRegistry::new();
    registry
        .register(WorkflowDefinition::new("etl", "start"))
        .unwrap();

    let err = registry
        .register(WorkflowDefinition::new("etl", "other"))
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRegistered(name) if name == "etl"));

    assert!(registry.get("etl").is_some());
    assert!(registry.get("missing").is_none());
}
