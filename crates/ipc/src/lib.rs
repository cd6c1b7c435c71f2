// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local-socket IPC between the parent engines and their spawned children.
//!
//! One listener per child (Unix domain socket where available, loopback TCP
//! otherwise), newline-delimited JSON frames, and a child-side client with
//! connect-retry and a heartbeat task.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod broker;
mod client;
mod endpoint;
mod env;
mod frame;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerHandler};
pub use client::{read_stdin_payload, ChildClient, ClientError, JobPayload};
pub use endpoint::{socket_file_name, socket_path, Endpoint, SocketKind, DEFAULT_PORT_RANGE};
pub use env::{
    ChildEnv, EnvError, ENV_JOB_ID, ENV_JOB_NAME, ENV_METADATA, ENV_PROCESS_ID, ENV_SOCKET_PATH,
    ENV_TCP_PORT,
};
pub use frame::{
    decode, encode, CpuStats, Frame, FrameBody, FrameError, FrameIdent, LogLevel, MemoryStats,
    MAX_FRAME_LEN,
};
