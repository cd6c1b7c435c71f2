// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Errors surfaced by the public engine APIs.
//!
//! Only structural errors reach callers. Work-item outcomes (handler
//! failures, non-zero exits, heartbeat timeouts) are recorded on the owning
//! record and observed through `get`, events, or progress frames.

use dl_ipc::BrokerError;
use dl_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no handler registered under {0:?}")]
    UnknownHandler(String),

    #[error("{0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("no workflow definition named {0:?}")]
    UnknownWorkflow(String),

    #[error("concurrency limit reached for {scope} ({limit})")]
    ConcurrencyLimit { scope: String, limit: usize },

    #[error("service {0:?} has a non-serializable config; isolated workflows require JSON-serializable service configs")]
    NonSerializableConfig(String),

    #[error("no record with id {0:?}")]
    InvalidId(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("spawn failed: {0}")]
    Spawn(String),
}
