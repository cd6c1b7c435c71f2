// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-child socket broker.
//!
//! The broker owns one listener per child, keyed by `(kind, id)`. Endpoints
//! can be reserved across parent restarts so an orphaned child retrying its
//! connection is not displaced by a new child landing on the same path or
//! port. Incoming frames are decoded off the socket read task and delivered
//! through a per-connection queue, so a slow handler keeps ordering without
//! ever blocking the read.

use crate::endpoint::{
    parse_socket_file_name, socket_path, Endpoint, SocketKind, DEFAULT_PORT_RANGE,
};
use crate::frame::{decode, Frame, FrameError, MAX_FRAME_LEN};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How many ports the TCP fallback probes before giving up.
const PORT_PROBE_ATTEMPTS: u32 = 128;

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("endpoint {endpoint} is reserved for {owner}")]
    EndpointReserved { endpoint: String, owner: String },

    #[error("no listener for {kind} {id}")]
    NotFound { kind: SocketKind, id: String },

    #[error("no free loopback port in {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("unix sockets unavailable on this platform")]
    UnixUnsupported,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Callbacks for one socket kind. Frame delivery is per-connection ordered.
pub trait BrokerHandler: Send + Sync + 'static {
    fn on_frame(&self, kind: SocketKind, id: &str, frame: Frame);

    fn on_disconnect(&self, _kind: SocketKind, _id: &str) {}

    fn on_error(&self, kind: SocketKind, id: &str, error: BrokerError) {
        warn!(%kind, id, error = %error, "ipc error");
    }
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Directory for Unix socket files.
    pub sock_dir: PathBuf,
    /// Loopback port range for the TCP fallback.
    pub port_range: RangeInclusive<u16>,
    /// Force the TCP fallback even where Unix sockets exist (tests).
    pub prefer_tcp: bool,
}

impl BrokerConfig {
    pub fn new(sock_dir: impl Into<PathBuf>) -> Self {
        Self {
            sock_dir: sock_dir.into(),
            port_range: DEFAULT_PORT_RANGE,
            prefer_tcp: cfg!(not(unix)),
        }
    }

    pub fn prefer_tcp(mut self, prefer: bool) -> Self {
        self.prefer_tcp = prefer;
        self
    }
}

type SocketId = (SocketKind, String);

struct ListenerHandle {
    endpoint: Endpoint,
    accept_task: JoinHandle<()>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

#[derive(Default)]
struct Inner {
    listeners: HashMap<SocketId, ListenerHandle>,
    reservations: HashMap<SocketId, Endpoint>,
}

/// The per-child socket broker.
pub struct Broker {
    config: BrokerConfig,
    inner: Mutex<Inner>,
    handlers: Arc<Mutex<HashMap<SocketKind, Arc<dyn BrokerHandler>>>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register the frame handler for one socket kind. Connections accepted
    /// before a handler is registered have their frames dropped.
    pub fn set_handler(&self, kind: SocketKind, handler: Arc<dyn BrokerHandler>) {
        self.handlers.lock().insert(kind, handler);
    }

    /// The live endpoint for a child, if one is bound.
    pub fn endpoint(&self, kind: SocketKind, id: &str) -> Option<Endpoint> {
        self.inner
            .lock()
            .listeners
            .get(&(kind, id.to_string()))
            .map(|h| h.endpoint.clone())
    }

    /// Create the listener for a child and return its endpoint.
    ///
    /// A stale Unix socket file left by a dead process is unlinked first.
    /// Fails if the endpoint is currently reserved for a different id.
    pub async fn create_socket(
        &self,
        kind: SocketKind,
        id: &str,
    ) -> Result<Endpoint, BrokerError> {
        // Honor an existing reservation for this id (reconnect path keeps
        // the same endpoint); otherwise pick a fresh one.
        let reserved = self
            .inner
            .lock()
            .reservations
            .get(&(kind, id.to_string()))
            .cloned();

        let endpoint = match reserved {
            Some(endpoint) => endpoint,
            None if self.config.prefer_tcp => {
                return self.bind_probed_tcp(kind, id).await;
            }
            None => Endpoint::Unix(socket_path(&self.config.sock_dir, kind, id)),
        };

        self.check_owner(kind, id, &endpoint)?;
        self.bind(kind, id, endpoint).await
    }

    /// Rebind a listener on a previously used endpoint so an orphaned child
    /// can reconnect on its next retry.
    pub async fn reconnect(
        &self,
        kind: SocketKind,
        id: &str,
        endpoint: Endpoint,
    ) -> Result<Endpoint, BrokerError> {
        self.reserve(kind, id, endpoint.clone())?;
        self.bind(kind, id, endpoint).await
    }

    /// Hold an endpoint for an id without binding it.
    pub fn reserve(
        &self,
        kind: SocketKind,
        id: &str,
        endpoint: Endpoint,
    ) -> Result<(), BrokerError> {
        self.check_owner(kind, id, &endpoint)?;
        self.inner
            .lock()
            .reservations
            .insert((kind, id.to_string()), endpoint);
        Ok(())
    }

    /// Drop a reservation.
    pub fn release(&self, kind: SocketKind, id: &str) {
        self.inner.lock().reservations.remove(&(kind, id.to_string()));
    }

    /// Close the child's listener: abort the peer connections, shut the
    /// listener, unlink the Unix file. The reservation (if any) survives.
    pub fn close_socket(&self, kind: SocketKind, id: &str) {
        let handle = self.inner.lock().listeners.remove(&(kind, id.to_string()));
        if let Some(handle) = handle {
            handle.accept_task.abort();
            for conn in handle.conns.lock().drain(..) {
                conn.abort();
            }
            if let Endpoint::Unix(ref path) = handle.endpoint {
                let _ = std::fs::remove_file(path);
            }
            debug!(%kind, id, endpoint = %handle.endpoint, "socket closed");
        }
    }

    /// Remove stray socket files whose id is neither live nor reserved nor
    /// in `active_ids`.
    pub fn clean_orphaned_sockets(&self, active_ids: &HashSet<String>) {
        let entries = match std::fs::read_dir(&self.config.sock_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let inner = self.inner.lock();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((kind, id)) = parse_socket_file_name(name) else {
                continue;
            };
            let key = (kind, id.to_string());
            if active_ids.contains(id)
                || inner.listeners.contains_key(&key)
                || inner.reservations.contains_key(&key)
            {
                continue;
            }
            debug!(%kind, id, "removing orphaned socket file");
            let _ = std::fs::remove_file(entry.path());
        }
    }

    /// Close everything. Reservations are dropped too.
    pub fn shutdown(&self) {
        let ids: Vec<SocketId> = self.inner.lock().listeners.keys().cloned().collect();
        for (kind, id) in ids {
            self.close_socket(kind, &id);
        }
        self.inner.lock().reservations.clear();
    }

    /// Reject endpoints held by a different id (live listener or reservation).
    fn check_owner(
        &self,
        kind: SocketKind,
        id: &str,
        endpoint: &Endpoint,
    ) -> Result<(), BrokerError> {
        let me: SocketId = (kind, id.to_string());
        let inner = self.inner.lock();
        for (key, ep) in inner
            .reservations
            .iter()
            .chain(inner.listeners.iter().map(|(key, h)| (key, &h.endpoint)))
        {
            if ep == endpoint && *key != me {
                return Err(BrokerError::EndpointReserved {
                    endpoint: endpoint.as_url(),
                    owner: key.1.clone(),
                });
            }
        }
        Ok(())
    }

    async fn bind(
        &self,
        kind: SocketKind,
        id: &str,
        endpoint: Endpoint,
    ) -> Result<Endpoint, BrokerError> {
        let listener = match &endpoint {
            Endpoint::Unix(path) => bind_unix(path)?,
            Endpoint::Tcp(port) => {
                ListenerSocket::Tcp(TcpListener::bind(("127.0.0.1", *port)).await?)
            }
        };
        self.install(kind, id, endpoint.clone(), listener);
        Ok(endpoint)
    }

    /// Pick a loopback port by random probe with a trial bind; the winning
    /// listener is kept, so there is no window between check and use.
    async fn bind_probed_tcp(
        &self,
        kind: SocketKind,
        id: &str,
    ) -> Result<Endpoint, BrokerError> {
        let start = *self.config.port_range.start();
        let end = *self.config.port_range.end();
        let span = (end - start) as u32 + 1;

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let mut offset = seed % span;

        for _ in 0..PORT_PROBE_ATTEMPTS.min(span) {
            let port = start + offset as u16;
            offset = (offset + 1) % span;

            let endpoint = Endpoint::Tcp(port);
            if self.check_owner(kind, id, &endpoint).is_err() {
                continue;
            }
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    self.install(kind, id, endpoint.clone(), ListenerSocket::Tcp(listener));
                    return Ok(endpoint);
                }
                Err(_) => continue,
            }
        }
        Err(BrokerError::NoFreePort { start, end })
    }

    fn install(&self, kind: SocketKind, id: &str, endpoint: Endpoint, listener: ListenerSocket) {
        // Replace any existing listener for this id. No unlink here: a
        // fresh listener may have just bound the same path, and removing
        // the file would orphan it.
        if let Some(old) = self.inner.lock().listeners.remove(&(kind, id.to_string())) {
            old.accept_task.abort();
            for conn in old.conns.lock().drain(..) {
                conn.abort();
            }
        }

        let conns: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            kind,
            id.to_string(),
            Arc::clone(&self.handlers),
            Arc::clone(&conns),
        ));

        self.inner.lock().listeners.insert(
            (kind, id.to_string()),
            ListenerHandle { endpoint, accept_task, conns },
        );
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum ListenerSocket {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

#[cfg(unix)]
fn bind_unix(path: &std::path::Path) -> Result<ListenerSocket, BrokerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket file"),
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(ListenerSocket::Unix(UnixListener::bind(path)?))
}

#[cfg(not(unix))]
fn bind_unix(_path: &std::path::Path) -> Result<ListenerSocket, BrokerError> {
    Err(BrokerError::UnixUnsupported)
}

impl ListenerSocket {
    async fn accept(&self) -> std::io::Result<Box<dyn AsyncRead + Unpin + Send>> {
        match self {
            #[cfg(unix)]
            ListenerSocket::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            ListenerSocket::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

async fn accept_loop(
    listener: ListenerSocket,
    kind: SocketKind,
    id: String,
    handlers: Arc<Mutex<HashMap<SocketKind, Arc<dyn BrokerHandler>>>>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                debug!(%kind, id, "child connected");
                let handlers = Arc::clone(&handlers);
                let id = id.clone();
                let conn = tokio::spawn(async move {
                    handle_connection(stream, kind, id, handlers).await;
                });
                let mut guard = conns.lock();
                guard.retain(|c| !c.is_finished());
                guard.push(conn);
            }
            Err(e) => {
                warn!(%kind, id, error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Read newline-delimited frames off one connection.
///
/// Decoded frames go through an unbounded per-connection queue with a
/// dedicated consumer task: handler callbacks therefore see frames in
/// receipt order, and a slow handler cannot stall the socket read.
async fn handle_connection(
    mut stream: Box<dyn AsyncRead + Unpin + Send>,
    kind: SocketKind,
    id: String,
    handlers: Arc<Mutex<HashMap<SocketKind, Arc<dyn BrokerHandler>>>>,
) {
    let handler = handlers.lock().get(&kind).cloned();
    let Some(handler) = handler else {
        debug!(%kind, id, "no handler registered, draining connection");
        let mut sink = [0u8; 4096];
        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let consumer = {
        let handler = Arc::clone(&handler);
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                handler.on_frame(kind, &id, frame);
            }
        })
    };

    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    // Set while discarding the remainder of an oversized line.
    let mut skipping = false;

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                handler.on_error(kind, &id, e.into());
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = buf.drain(..=pos).collect();
            if skipping {
                skipping = false;
                continue;
            }
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            match decode(line) {
                Ok(frame) => {
                    if tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(e) => handler.on_error(kind, &id, e.into()),
            }
        }

        // An unterminated line past the cap is rejected now and its
        // remainder discarded up to the next newline.
        if !skipping && buf.len() > MAX_FRAME_LEN {
            handler.on_error(
                kind,
                &id,
                FrameError::TooLong { len: buf.len() }.into(),
            );
            buf.clear();
            skipping = true;
        }
    }

    drop(tx);
    let _ = consumer.await;
    handler.on_disconnect(kind, &id);
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
