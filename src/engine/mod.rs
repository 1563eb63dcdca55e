// src/engine/mod.rs

//! Execution coordinator.
//!
//! This module ties together:
//! - the execution queue (FIFO, one request in flight)
//! - the coordinator state machine that correlates kernel replies by
//!   sequence number
//! - the runtime event loop that reacts to:
//!   - caller commands (submit, interrupt, restart, ...)
//!   - messages and exit notifications from the transport
//!   - stream aggregator timers
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`]; callers talk to it through [`handle`].

use std::fmt;

use tokio::sync::oneshot;

use crate::config::KernelSection;
use crate::errors::Result;
use crate::sink::BufferId;

pub mod core;
pub mod event_handlers;
pub mod handle;
pub mod queue;
pub mod runtime;

pub use self::core::Coordinator;
pub use event_handlers::{CoreCommand, CoreStep, LifecycleEvent, StreamCommand};
pub use handle::{CoordinatorHandle, channel};
pub use queue::{ExecutionQueue, ExecutionRequest, PendingEntry};
pub use runtime::{LifecycleObserver, Runtime};

/// Coordinator connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CoordinatorState {
    #[default]
    Disconnected,
    /// Transport is up (or being launched); waiting for `ready`.
    Connecting,
    Ready,
    /// A request is dispatched to the kernel.
    Busy,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Disconnected => "disconnected",
            CoordinatorState::Connecting => "connecting",
            CoordinatorState::Ready => "ready",
            CoordinatorState::Busy => "busy",
        };
        f.write_str(name)
    }
}

/// Kernel spec sent with `start` and `restart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    pub name: String,
    pub cwd: Option<String>,
}

impl KernelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cwd: None,
        }
    }

    pub fn from_config(kernel: &KernelSection) -> Self {
        Self {
            name: kernel.name.clone(),
            cwd: kernel
                .cwd
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// Where a submission comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Anchor {
    pub buffer: BufferId,
    /// Line status indicators attach to.
    pub anchor_line: usize,
    /// First line of the submitted span.
    pub start_line: usize,
}

impl Anchor {
    pub fn new(buffer: BufferId, anchor_line: usize, start_line: usize) -> Self {
        Self {
            buffer,
            anchor_line,
            start_line,
        }
    }

    pub fn at_line(line: usize) -> Self {
        Self::new(0, line, line)
    }
}

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// Shut the kernel down and stop the runtime once nothing is queued or
    /// pending.
    pub exit_when_idle: bool,
}

/// Read-only view of the coordinator, for callers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub state: CoordinatorState,
    /// Requests in the queue, including the one in flight.
    pub queued: usize,
    pub inflight: Option<u64>,
    /// Sequences with unfinalised entries, ascending.
    pub pending: Vec<u64>,
}

/// Commands flowing into the runtime from [`CoordinatorHandle`]s.
#[derive(Debug)]
pub enum RuntimeEvent {
    Submit {
        code: String,
        anchor: Anchor,
        reply: oneshot::Sender<Result<u64>>,
    },
    Interrupt {
        drop_queue: bool,
    },
    CancelQueue,
    Restart {
        kernel: Option<String>,
    },
    Pause,
    Resume,
    ReplyStdin {
        text: String,
    },
    /// Shut the kernel down; the coordinator stays usable.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    /// Stop once idle (immediately if already idle).
    ExitWhenIdle,
    Snapshot {
        reply: oneshot::Sender<CoordinatorSnapshot>,
    },
    /// Shut the kernel down and end the runtime loop.
    Stop,
}
