// src/protocol/messages.rs

use serde::{Deserialize, Serialize};

use crate::types::Channel;

/// Message sent from the coordinator to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Initialise a kernel of the given spec in the given working directory.
    Start {
        kernel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Run `code`; every reply is tagged with `seq`.
    Execute { code: String, seq: u64 },
    Interrupt,
    Restart {
        kernel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    Pause,
    Resume,
    /// Answer to a kernel-issued input request.
    StdinReply { text: String },
    Shutdown,
}

impl Outbound {
    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Start { .. } => "start",
            Outbound::Execute { .. } => "execute",
            Outbound::Interrupt => "interrupt",
            Outbound::Restart { .. } => "restart",
            Outbound::Pause => "pause",
            Outbound::Resume => "resume",
            Outbound::StdinReply { .. } => "stdin_reply",
            Outbound::Shutdown => "shutdown",
        }
    }
}

/// Message received from the bridge.
///
/// Unknown `type` values fail to decode and are dropped by the framing layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// The kernel accepted `start`/`restart`; the queue may be dispatched.
    Ready,
    /// Partial output. `name` may be missing or null on the wire.
    Stream {
        seq: u64,
        #[serde(default)]
        name: Option<Channel>,
        #[serde(default)]
        text: String,
    },
    Result {
        seq: u64,
        #[serde(default)]
        value: String,
    },
    Markdown {
        seq: u64,
        #[serde(default)]
        value: String,
    },
    Image { seq: u64, path: String },
    /// Execution raised. `seq` is absent for bridge-level failures.
    Error {
        #[serde(default)]
        seq: Option<u64>,
        #[serde(default)]
        ename: String,
        #[serde(default)]
        evalue: String,
        #[serde(default)]
        traceback: String,
    },
    Done { seq: u64 },
    Interrupted,
    StdinRequest {
        #[serde(default)]
        prompt: String,
    },
    Paused {
        #[serde(default)]
        message: Option<String>,
    },
    Resumed {
        #[serde(default)]
        message: Option<String>,
    },
    PauseFailed {
        #[serde(default)]
        message: Option<String>,
    },
    ResumeFailed {
        #[serde(default)]
        message: Option<String>,
    },
    /// The bridge is terminating.
    Bye,
}

impl Inbound {
    /// Sequence number the message answers, if it carries one.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Inbound::Stream { seq, .. }
            | Inbound::Result { seq, .. }
            | Inbound::Markdown { seq, .. }
            | Inbound::Image { seq, .. }
            | Inbound::Done { seq } => Some(*seq),
            Inbound::Error { seq, .. } => *seq,
            _ => None,
        }
    }
}
