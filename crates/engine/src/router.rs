// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame routing from the broker into per-record processor tasks.
//!
//! Broker callbacks are synchronous; record mutation is async. Each engine
//! keeps one unbounded channel per live child and a consumer task that
//! applies frames sequentially, preserving per-connection order end to end.

use dl_ipc::{BrokerHandler, Frame, SocketKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Shared id → sender map. The owning engine inserts a sender when it
/// spawns or reconnects a child and removes it on cleanup.
pub(crate) type FrameTxs = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>>;

pub(crate) fn new_frame_txs() -> FrameTxs {
    Arc::new(Mutex::new(HashMap::new()))
}

/// [`BrokerHandler`] forwarding frames into the per-record channels.
pub(crate) struct FrameRouter {
    txs: FrameTxs,
}

impl FrameRouter {
    pub fn new(txs: FrameTxs) -> Self {
        Self { txs }
    }
}

impl BrokerHandler for FrameRouter {
    fn on_frame(&self, kind: SocketKind, id: &str, frame: Frame) {
        match self.txs.lock().get(id) {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => debug!(%kind, id, "frame for unknown record dropped"),
        }
    }

    fn on_disconnect(&self, kind: SocketKind, id: &str) {
        // The listener stays up and the child may reconnect; liveness is
        // the watchdog's problem.
        debug!(%kind, id, "child disconnected");
    }
}
