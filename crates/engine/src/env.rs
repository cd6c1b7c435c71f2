// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the engine crate.

use dl_ipc::BrokerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Broker configuration rooted at the resolved socket directory.
pub fn broker_config() -> BrokerConfig {
    BrokerConfig::new(sock_dir())
}

/// Socket directory: `DONKEYLABS_SOCK_DIR` > XDG state dir > /tmp fallback.
pub fn sock_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DONKEYLABS_SOCK_DIR") {
        return PathBuf::from(dir);
    }
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/state")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("donkeylabs/sock")
}

/// Jobs tick interval override.
pub fn poll_interval() -> Option<Duration> {
    std::env::var("DONKEYLABS_POLL_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Path to the isolated workflow executor binary.
///
/// Falls back to a `dl-workflow-runner` sibling of the current executable,
/// then to the bare name (resolved via PATH).
pub fn runner_binary() -> PathBuf {
    if let Ok(path) = std::env::var("DONKEYLABS_RUNNER_BINARY") {
        return PathBuf::from(path);
    }
    if let Ok(current) = std::env::current_exe() {
        let sibling = current.with_file_name("dl-workflow-runner");
        if sibling.exists() {
            return sibling;
        }
    }
    PathBuf::from("dl-workflow-runner")
}
