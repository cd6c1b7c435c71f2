// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Socket endpoint naming.
//!
//! Unix endpoints are filesystem paths of the form `<dir>/<kind>_<id>.sock`;
//! non-Unix platforms fall back to a loopback TCP port from a configured
//! range. The URL form handed to children is either the bare path or
//! `tcp://127.0.0.1:<port>`.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

/// Default loopback port range for the TCP fallback (the IANA dynamic range).
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

/// The kind prefix baked into socket file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    Job,
    Proc,
    /// Isolated workflow executor.
    Wfl,
}

impl std::fmt::Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SocketKind::Job => "job",
            SocketKind::Proc => "proc",
            SocketKind::Wfl => "wfl",
        })
    }
}

/// A bound or reservable child endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(u16),
}

impl Endpoint {
    /// The form written into the child's environment / stdin payload:
    /// the socket path on Unix, `tcp://127.0.0.1:<port>` otherwise.
    pub fn as_url(&self) -> String {
        match self {
            Endpoint::Unix(path) => path.to_string_lossy().into_owned(),
            Endpoint::Tcp(port) => format!("tcp://127.0.0.1:{port}"),
        }
    }

    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            Endpoint::Unix(path) => Some(path),
            Endpoint::Tcp(_) => None,
        }
    }

    pub fn tcp_port(&self) -> Option<u16> {
        match self {
            Endpoint::Unix(_) => None,
            Endpoint::Tcp(port) => Some(*port),
        }
    }

    /// Inverse of [`Endpoint::as_url`].
    pub fn parse_url(url: &str) -> Self {
        match url
            .strip_prefix("tcp://127.0.0.1:")
            .and_then(|port| port.parse::<u16>().ok())
        {
            Some(port) => Endpoint::Tcp(port),
            None => Endpoint::Unix(url.into()),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_url())
    }
}

/// `<kind>_<id>.sock`
pub fn socket_file_name(kind: SocketKind, id: &str) -> String {
    format!("{kind}_{id}.sock")
}

/// `<dir>/<kind>_<id>.sock`
pub fn socket_path(dir: &Path, kind: SocketKind, id: &str) -> PathBuf {
    dir.join(socket_file_name(kind, id))
}

/// Parse a socket file name back into its kind and id. Returns `None` for
/// files that do not follow the naming scheme.
pub fn parse_socket_file_name(name: &str) -> Option<(SocketKind, &str)> {
    let stem = name.strip_suffix(".sock")?;
    let (kind, id) = stem.split_once('_')?;
    let kind = match kind {
        "job" => SocketKind::Job,
        "proc" => SocketKind::Proc,
        "wfl" => SocketKind::Wfl,
        _ => return None,
    };
    if id.is_empty() {
        return None;
    }
    Some((kind, id))
}

#[cfg(test)]
#[path = "endpoint_tests.rs"]
mod tests;
