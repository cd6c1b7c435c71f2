// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child protocol codec: newline-delimited UTF-8 JSON frames.
//!
//! Every frame carries `{type, <id-field>, timestamp}` where the id field is
//! `jobId`, `processId`, or `instanceId` depending on the child kind. Frames
//! missing any of the three are rejected at decode, as are lines over 1 MiB.
//!
//! Serializes with `{"type": "step.completed", ...fields}` format, the same
//! internally-tagged shape the persisted records use.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum encoded frame length (1 MiB), newline excluded.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame exceeds {MAX_FRAME_LEN} bytes ({len})")]
    TooLong { len: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is not valid UTF-8")]
    NotUtf8,
}

/// The id field of a frame, named after the record kind it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameIdent {
    Job {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    Process {
        #[serde(rename = "processId")]
        process_id: String,
    },
    Instance {
        #[serde(rename = "instanceId")]
        instance_id: String,
    },
}

impl FrameIdent {
    pub fn job(id: impl Into<String>) -> Self {
        FrameIdent::Job { job_id: id.into() }
    }

    pub fn process(id: impl Into<String>) -> Self {
        FrameIdent::Process { process_id: id.into() }
    }

    pub fn instance(id: impl Into<String>) -> Self {
        FrameIdent::Instance { instance_id: id.into() }
    }

    /// The record id regardless of kind.
    pub fn id(&self) -> &str {
        match self {
            FrameIdent::Job { job_id } => job_id,
            FrameIdent::Process { process_id } => process_id,
            FrameIdent::Instance { instance_id } => instance_id,
        }
    }
}

/// Log severity carried on `log` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// CPU sample inside a `stats` frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CpuStats {
    pub user: f64,
    pub system: f64,
    pub percent: f64,
}

/// Memory sample inside a `stats` frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MemoryStats {
    pub rss: u64,
    #[serde(rename = "heapTotal")]
    pub heap_total: u64,
    #[serde(rename = "heapUsed")]
    pub heap_used: u64,
    pub external: u64,
}

/// Frame payload variants, child → parent.
///
/// The `step.*` and `ready`/`event` variants are only produced by the
/// isolated workflow executor; job and process children use the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrameBody {
    /// Initial handshake after socket accept.
    #[serde(rename = "connected")]
    Connected,

    #[serde(rename = "heartbeat")]
    Heartbeat,

    /// The child has begun doing work for its record.
    #[serde(rename = "started")]
    Started,

    #[serde(rename = "progress")]
    Progress {
        percent: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    #[serde(rename = "log")]
    Log {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Terminal: success.
    #[serde(rename = "completed")]
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },

    /// Terminal: failure.
    #[serde(rename = "failed")]
    Failed {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },

    /// Periodic resource sample.
    #[serde(rename = "stats")]
    Stats {
        cpu: CpuStats,
        memory: MemoryStats,
        uptime: f64,
    },

    /// Soft close notice.
    #[serde(rename = "disconnecting")]
    Disconnecting,

    /// Isolated workflow executor is bootstrapped and about to drive.
    #[serde(rename = "ready")]
    Ready,

    #[serde(rename = "step.started")]
    StepStarted { step: String },

    #[serde(rename = "step.completed")]
    StepCompleted {
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },

    #[serde(rename = "step.failed")]
    StepFailed { step: String, error: String },

    #[serde(rename = "step.poll")]
    StepPoll {
        step: String,
        #[serde(rename = "pollCount")]
        poll_count: u32,
    },

    #[serde(rename = "step.loop")]
    StepLoop {
        step: String,
        #[serde(rename = "loopCount")]
        loop_count: u32,
    },

    /// Application event published inside the isolated executor, mirrored
    /// onto the parent's event fabric.
    #[serde(rename = "event")]
    ChildEvent { topic: String, payload: Value },
}

impl FrameBody {
    /// Terminal frames transition the owning record to completed/failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameBody::Completed { .. } | FrameBody::Failed { .. })
    }
}

/// One decoded IPC frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(flatten)]
    pub body: FrameBody,
    #[serde(flatten)]
    pub ident: FrameIdent,
    /// Producer clock, epoch milliseconds.
    pub timestamp: u64,
}

impl Frame {
    pub fn new(ident: FrameIdent, body: FrameBody, timestamp: u64) -> Self {
        Self { body, ident, timestamp }
    }
}

/// Encode a frame as one newline-terminated JSON line.
pub fn encode(frame: &Frame) -> Result<String, FrameError> {
    let mut line = serde_json::to_string(frame)?;
    if line.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLong { len: line.len() });
    }
    line.push('\n');
    Ok(line)
}

/// Decode one line (newline already stripped) into a frame.
pub fn decode(line: &[u8]) -> Result<Frame, FrameError> {
    if line.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLong { len: line.len() });
    }
    let text = std::str::from_utf8(line).map_err(|_| FrameError::NotUtf8)?;
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "frame_property_tests.rs"]
mod property_tests;
