// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child-side protocol client.
//!
//! Spawned workers (external job handlers, managed processes, the isolated
//! workflow executor) connect back to the parent's per-child listener with
//! this client: connect with retry, send the `connected` handshake, then
//! stream frames. A heartbeat task keeps the watchdog satisfied.

use crate::endpoint::Endpoint;
use crate::frame::{encode, Frame, FrameBody, FrameError, FrameIdent};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Errors from the child client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {endpoint} after {attempts} attempts: {last}")]
    Connect {
        endpoint: String,
        attempts: u32,
        last: std::io::Error,
    },

    #[error("unix sockets unavailable on this platform")]
    UnixUnsupported,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stdin payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("stdin closed before the payload line arrived")]
    NoPayload,
}

#[derive(Debug)]
enum ClientStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl ClientStream {
    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            ClientStream::Unix(stream) => stream.write_all(line.as_bytes()).await,
            ClientStream::Tcp(stream) => stream.write_all(line.as_bytes()).await,
        }
    }
}

/// Connected protocol client bound to one record identity.
#[derive(Debug)]
pub struct ChildClient {
    ident: FrameIdent,
    stream: Mutex<ClientStream>,
}

impl ChildClient {
    /// Connect with default retry (30 attempts, 250 ms apart) and send the
    /// `connected` handshake.
    pub async fn connect(endpoint: &Endpoint, ident: FrameIdent) -> Result<Self, ClientError> {
        Self::connect_with_retry(endpoint, ident, 30, Duration::from_millis(250)).await
    }

    /// Connect with explicit retry parameters. Retrying covers both the
    /// spawn race (child up before the listener) and the orphan-reconnect
    /// window after a parent restart.
    pub async fn connect_with_retry(
        endpoint: &Endpoint,
        ident: FrameIdent,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, ClientError> {
        let mut last: Option<std::io::Error> = None;
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            match Self::dial(endpoint).await {
                Ok(stream) => {
                    let client = Self { ident, stream: Mutex::new(stream) };
                    client.send(FrameBody::Connected).await?;
                    debug!(endpoint = %endpoint, "connected to parent");
                    return Ok(client);
                }
                Err(ClientError::Io(e)) => last = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(ClientError::Connect {
            endpoint: endpoint.as_url(),
            attempts: attempts.max(1),
            last: last.unwrap_or_else(|| std::io::Error::other("no attempt made")),
        })
    }

    async fn dial(endpoint: &Endpoint) -> Result<ClientStream, ClientError> {
        match endpoint {
            Endpoint::Unix(path) => {
                #[cfg(unix)]
                {
                    Ok(ClientStream::Unix(UnixStream::connect(path).await?))
                }
                #[cfg(not(unix))]
                {
                    let _ = path;
                    Err(ClientError::UnixUnsupported)
                }
            }
            Endpoint::Tcp(port) => {
                Ok(ClientStream::Tcp(TcpStream::connect(("127.0.0.1", *port)).await?))
            }
        }
    }

    /// Send one frame, stamped with the current time.
    pub async fn send(&self, body: FrameBody) -> Result<(), ClientError> {
        let frame = Frame::new(self.ident.clone(), body, epoch_ms());
        let line = encode(&frame)?;
        self.stream.lock().await.write_line(&line).await?;
        Ok(())
    }

    /// Spawn a task sending `heartbeat` frames on the given interval until
    /// the client is dropped (send failure stops the task).
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if client.send(FrameBody::Heartbeat).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Send the soft-close notice. Best effort.
    pub async fn disconnect(&self) {
        let _ = self.send(FrameBody::Disconnecting).await;
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The one-line JSON payload an external job child reads from stdin before
/// the parent closes the pipe.
#[derive(Debug, Clone, Deserialize)]
pub struct JobPayload {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub name: String,
    pub data: Value,
    /// Socket path, or `tcp://127.0.0.1:<port>` on non-Unix hosts.
    #[serde(rename = "socketPath")]
    pub socket_path: String,
}

impl JobPayload {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::parse_url(&self.socket_path)
    }
}

/// Read the initial payload line from this process's stdin.
pub async fn read_stdin_payload() -> Result<JobPayload, ClientError> {
    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ClientError::NoPayload);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
