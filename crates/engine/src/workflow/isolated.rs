// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Parent half of isolated workflow execution.
//!
//! The executor subprocess owns the instance record (it runs the same
//! state machine against the shared database); the parent's job is to
//! launch it, keep `metadata.__watchdog` current so the watchdog can
//! police it, and mirror its lifecycle frames into the observer and the
//! event fabric.

use super::engine::WfInner;
use crate::error::EngineError;
use crate::spawner::SpawnSpec;
use dl_core::{Clock, InstanceUpdate, WatchdogMeta, WorkflowInstance, WorkflowStatus};
use dl_ipc::{Frame, FrameBody, SocketKind};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Launch the executor for one instance.
pub(super) async fn launch<C: Clock>(
    inner: &Arc<WfInner<C>>,
    instance: &WorkflowInstance,
) -> Result<(), EngineError> {
    let Some(ref isolation) = inner.config.isolation else {
        return Err(EngineError::Spawn("isolation is not configured".to_string()));
    };
    let id = instance.id.to_string();

    let endpoint = inner.broker.create_socket(SocketKind::Wfl, &id).await?;

    let plugins: Vec<Value> = inner
        .services
        .serializable_configs()
        .into_iter()
        .map(|(name, config)| json!({ "name": name, "config": config }))
        .collect();
    let bootstrap = json!({
        "dbPath": isolation.db_path,
        "workflowName": instance.workflow_name,
        "instanceId": id,
        "socketPath": endpoint.as_url(),
        "plugins": plugins,
    })
    .to_string();

    let child = inner
        .spawner
        .spawn(SpawnSpec {
            command: isolation.runner_binary.to_string_lossy().into_owned(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin_line: Some(bootstrap),
        })
        .await
        .map_err(|e| {
            cleanup_child(inner, &id);
            EngineError::Spawn(e.to_string())
        })?;

    let pid = child.pid;
    write_watchdog_meta(inner, &id, pid).await;
    info!(instance_id = %id, pid, "workflow executor spawned");

    attach_frame_processor(inner, &id);

    // Executor death without a terminal frame fails the instance.
    let watcher = Arc::clone(inner);
    let exit_id = id.clone();
    tokio::spawn(async move {
        let code = child.exit.await.ok().flatten();
        let Ok(Some(current)) = watcher.store.get(&exit_id).await else {
            return;
        };
        if current.is_terminal() {
            cleanup_child(&watcher, &exit_id);
            return;
        }
        let error = match code {
            Some(code) => format!("Workflow executor exited with code {code}"),
            None => "Workflow executor killed by signal".to_string(),
        };
        warn!(instance_id = %exit_id, error, "executor died mid-run");
        let _ = watcher
            .store
            .update(
                &exit_id,
                InstanceUpdate::new()
                    .status(WorkflowStatus::Failed)
                    .error(Some(error.clone()))
                    .completed_at(Some(watcher.clock.now_utc())),
            )
            .await;
        if let Ok(Some(refreshed)) = watcher.store.get(&exit_id).await {
            watcher.observer.on_failed(&refreshed, &error);
        }
        cleanup_child(&watcher, &exit_id);
    });

    Ok(())
}

fn attach_frame_processor<C: Clock>(inner: &Arc<WfInner<C>>, id: &str) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    inner.frame_txs.lock().insert(id.to_string(), tx);
    let inner = Arc::clone(inner);
    let id = id.to_string();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            handle_frame(&inner, &id, frame).await;
        }
    });
}

async fn handle_frame<C: Clock>(inner: &Arc<WfInner<C>>, id: &str, frame: Frame) {
    // Every frame refreshes the watchdog heartbeat.
    touch_watchdog_meta(inner, id).await;

    let instance = match inner.store.get(id).await {
        Ok(Some(instance)) => instance,
        _ => return,
    };

    match frame.body {
        FrameBody::Connected | FrameBody::Heartbeat => {}
        FrameBody::Ready => debug!(instance_id = id, "executor ready"),
        FrameBody::Started => debug!(instance_id = id, "executor driving"),

        FrameBody::StepStarted { step } => {
            inner.observer.on_step_started(&instance, &step);
        }
        FrameBody::StepCompleted { step, output } => {
            inner
                .observer
                .on_step_completed(&instance, &step, &output.unwrap_or(Value::Null));
        }
        FrameBody::StepFailed { step, error } => {
            inner.observer.on_step_failed(&instance, &step, &error);
        }
        FrameBody::StepPoll { step, poll_count } => {
            inner.observer.on_step_poll(&instance, &step, poll_count);
        }
        FrameBody::StepLoop { step, loop_count } => {
            inner.observer.on_step_loop(&instance, &step, loop_count);
        }
        FrameBody::Progress { percent, .. } => {
            inner.observer.on_progress(&instance, percent.round() as u32);
        }
        FrameBody::ChildEvent { topic, payload } => {
            inner.events.publish(&topic, payload);
        }
        FrameBody::Log { level, message, data } => {
            inner.events.publish(
                "workflow.log",
                json!({ "instanceId": id, "level": level, "message": message, "data": data }),
            );
        }

        // The executor persists terminal state itself before sending the
        // frame; the parent only mirrors events and releases resources.
        FrameBody::Completed { result } => {
            inner
                .observer
                .on_completed(&instance, &result.unwrap_or(Value::Null));
            cleanup_child(inner, id);
        }
        FrameBody::Failed { error, .. } => {
            inner.observer.on_failed(&instance, &error);
            cleanup_child(inner, id);
        }

        FrameBody::Disconnecting => debug!(instance_id = id, "executor disconnecting"),
        other => debug!(instance_id = id, frame = ?other, "unexpected frame kind ignored"),
    }
}

/// Install `metadata.__watchdog` for a fresh executor.
async fn write_watchdog_meta<C: Clock>(inner: &Arc<WfInner<C>>, id: &str, pid: u32) {
    let Ok(Some(instance)) = inner.store.get(id).await else {
        return;
    };
    let mut instance = instance;
    instance.set_watchdog_meta(WatchdogMeta {
        pid,
        last_heartbeat: inner.clock.now_utc(),
    });
    let _ = inner
        .store
        .update(id, InstanceUpdate::new().metadata(instance.metadata))
        .await;
}

/// Refresh `metadata.__watchdog.lastHeartbeat`, keeping the pid.
async fn touch_watchdog_meta<C: Clock>(inner: &Arc<WfInner<C>>, id: &str) {
    let Ok(Some(instance)) = inner.store.get(id).await else {
        return;
    };
    let Some(meta) = instance.watchdog_meta() else {
        return;
    };
    let mut instance = instance;
    instance.set_watchdog_meta(WatchdogMeta {
        pid: meta.pid,
        last_heartbeat: inner.clock.now_utc(),
    });
    let _ = inner
        .store
        .update(id, InstanceUpdate::new().metadata(instance.metadata))
        .await;
}

/// Release the socket and frame channel for one executor.
pub(super) fn cleanup_child<C: Clock>(inner: &Arc<WfInner<C>>, id: &str) {
    inner.frame_txs.lock().remove(id);
    inner.broker.close_socket(SocketKind::Wfl, id);
    inner.broker.release(SocketKind::Wfl, id);
}
