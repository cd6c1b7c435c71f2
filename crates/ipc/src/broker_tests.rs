// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::client::ChildClient;
use crate::frame::{FrameBody, FrameIdent, LogLevel};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Test handler collecting everything it sees.
#[derive(Default)]
struct Collect {
    frames: Mutex<Vec<Frame>>,
    disconnects: AtomicUsize,
    errors: Mutex<Vec<String>>,
}

impl BrokerHandler for Collect {
    fn on_frame(&self, _kind: SocketKind, _id: &str, frame: Frame) {
        self.frames.lock().push(frame);
    }

    fn on_disconnect(&self, _kind: SocketKind, _id: &str) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _kind: SocketKind, _id: &str, error: BrokerError) {
        self.errors.lock().push(error.to_string());
    }
}

fn test_broker(dir: &std::path::Path) -> (Arc<Broker>, Arc<Collect>) {
    let broker = Arc::new(Broker::new(BrokerConfig::new(dir)));
    let collect = Arc::new(Collect::default());
    broker.set_handler(SocketKind::Job, Arc::clone(&collect) as Arc<dyn BrokerHandler>);
    (broker, collect)
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[cfg(unix)]
#[tokio::test]
async fn create_socket_binds_expected_unix_path() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _) = test_broker(dir.path());

    let endpoint = broker.create_socket(SocketKind::Job, "job-1").await.unwrap();
    let path = endpoint.unix_path().unwrap();
    assert_eq!(path, socket_path(dir.path(), SocketKind::Job, "job-1"));
    assert!(path.exists());

    broker.close_socket(SocketKind::Job, "job-1");
    assert!(!path.exists());
}

#[cfg(unix)]
#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _) = test_broker(dir.path());

    let path = socket_path(dir.path(), SocketKind::Job, "job-1");
    std::fs::write(&path, b"stale").unwrap();

    let endpoint = broker.create_socket(SocketKind::Job, "job-1").await.unwrap();
    assert_eq!(endpoint.unix_path().unwrap(), path);
}

#[tokio::test]
async fn frames_arrive_in_receipt_order() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, collect) = test_broker(dir.path());

    let endpoint = broker.create_socket(SocketKind::Job, "job-1").await.unwrap();
    let client = ChildClient::connect(&endpoint, FrameIdent::job("job-1"))
        .await
        .unwrap();

    for i in 0..50u32 {
        client
            .send(FrameBody::Log {
                level: LogLevel::Info,
                message: format!("line {i}"),
                data: None,
            })
            .await
            .unwrap();
    }

    wait_for(|| collect.frames.lock().len() >= 51).await;

    let frames = collect.frames.lock();
    assert_eq!(frames[0].body, FrameBody::Connected);
    for (i, frame) in frames[1..].iter().enumerate() {
        match &frame.body {
            FrameBody::Log { message, .. } => assert_eq!(message, &format!("line {i}")),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn tcp_fallback_probes_a_port() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::new(BrokerConfig::new(dir.path()).prefer_tcp(true));
    let collect = Arc::new(Collect::default());
    broker.set_handler(SocketKind::Job, Arc::clone(&collect) as Arc<dyn BrokerHandler>);

    let endpoint = broker.create_socket(SocketKind::Job, "job-1").await.unwrap();
    let port = endpoint.tcp_port().unwrap();
    assert!(DEFAULT_PORT_RANGE.contains(&port));

    let client = ChildClient::connect(&endpoint, FrameIdent::job("job-1"))
        .await
        .unwrap();
    client.send(FrameBody::Started).await.unwrap();

    wait_for(|| collect.frames.lock().len() >= 2).await;
    assert_eq!(collect.frames.lock()[1].body, FrameBody::Started);
}

#[tokio::test]
async fn reservation_blocks_other_ids() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _) = test_broker(dir.path());

    let endpoint = Endpoint::Tcp(55_555);
    broker.reserve(SocketKind::Job, "job-1", endpoint.clone()).unwrap();

    // Same endpoint, different id: rejected for reserve and reconnect.
    let err = broker
        .reserve(SocketKind::Job, "job-2", endpoint.clone())
        .unwrap_err();
    assert!(matches!(err, BrokerError::EndpointReserved { .. }));
    let err = broker
        .reconnect(SocketKind::Job, "job-2", endpoint.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::EndpointReserved { .. }));

    // The owner itself may rebind.
    broker
        .reconnect(SocketKind::Job, "job-1", endpoint)
        .await
        .unwrap();

    // After release + close, the endpoint is free again.
    broker.close_socket(SocketKind::Job, "job-1");
    broker.release(SocketKind::Job, "job-1");
    broker.reserve(SocketKind::Job, "job-2", Endpoint::Tcp(55_555)).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn reserved_id_keeps_its_endpoint_across_create() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _) = test_broker(dir.path());

    let path = socket_path(dir.path(), SocketKind::Job, "job-1");
    broker
        .reserve(SocketKind::Job, "job-1", Endpoint::Unix(path.clone()))
        .unwrap();

    let endpoint = broker.create_socket(SocketKind::Job, "job-1").await.unwrap();
    assert_eq!(endpoint.unix_path().unwrap(), path);
}

#[cfg(unix)]
#[tokio::test]
async fn malformed_frames_are_reported_and_connection_survives() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, collect) = test_broker(dir.path());

    let endpoint = broker.create_socket(SocketKind::Job, "job-1").await.unwrap();
    let mut raw = UnixStream::connect(endpoint.unix_path().unwrap())
        .await
        .unwrap();

    raw.write_all(b"this is not json\n").await.unwrap();
    raw.write_all(br#"{"type":"heartbeat","jobId":"job-1","timestamp":5}"#)
        .await
        .unwrap();
    raw.write_all(b"\n").await.unwrap();

    wait_for(|| !collect.frames.lock().is_empty()).await;

    assert_eq!(collect.errors.lock().len(), 1);
    assert_eq!(collect.frames.lock()[0].body, FrameBody::Heartbeat);
    assert_eq!(collect.disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn peer_disconnect_keeps_listener_alive() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, collect) = test_broker(dir.path());

    let endpoint = broker.create_socket(SocketKind::Job, "job-1").await.unwrap();

    let client = ChildClient::connect(&endpoint, FrameIdent::job("job-1"))
        .await
        .unwrap();
    drop(client);
    wait_for(|| collect.disconnects.load(Ordering::SeqCst) == 1).await;

    // Child reconnects against the same listener.
    let client = ChildClient::connect(&endpoint, FrameIdent::job("job-1"))
        .await
        .unwrap();
    client.send(FrameBody::Started).await.unwrap();
    wait_for(|| {
        collect
            .frames
            .lock()
            .iter()
            .any(|f| f.body == FrameBody::Started)
    })
    .await;
}

#[cfg(unix)]
#[tokio::test]
async fn orphan_sweep_spares_live_reserved_and_active() {
    let dir = tempfile::tempdir().unwrap();
    let (broker, _) = test_broker(dir.path());

    broker.create_socket(SocketKind::Job, "job-live").await.unwrap();
    broker
        .reserve(
            SocketKind::Job,
            "job-reserved",
            Endpoint::Unix(socket_path(dir.path(), SocketKind::Job, "job-reserved")),
        )
        .unwrap();

    // Stray files: one for a known-active id, one truly orphaned, one that
    // does not follow the naming scheme.
    for name in ["job_job-active.sock", "job_job-orphan.sock", "random.txt"] {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }

    let active: HashSet<String> = ["job-active".to_string()].into_iter().collect();
    broker.clean_orphaned_sockets(&active);

    assert!(dir.path().join("job_job-live.sock").exists());
    assert!(dir.path().join("job_job-active.sock").exists());
    assert!(dir.path().join("random.txt").exists());
    assert!(!dir.path().join("job_job-orphan.sock").exists());
}
