// src/transport/backend.rs

//! Pluggable transport abstraction.
//!
//! The runtime talks to a `KernelLauncher` / `KernelTransport` pair instead
//! of a concrete child process. Production code uses [`ProcessLauncher`];
//! tests provide a fake that records outbound messages and lets the test
//! inject inbound ones.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::config::KernelSection;
use crate::errors::Result;
use crate::protocol::{Inbound, Outbound};

use super::process::ProcessTransport;

/// Events a transport delivers to its single consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Every message decoded from one read of the output stream, in order.
    Messages(Vec<Inbound>),
    /// The subprocess exited; all of its streams are already closed.
    Exited { code: Option<i32> },
}

/// One live conversation with a bridge process.
pub trait KernelTransport: Send {
    /// Queue `message` for delivery.
    ///
    /// A no-op when the transport is closed; delivery is never guaranteed.
    fn send(&mut self, message: &Outbound);

    /// Close all streams and request graceful termination.
    ///
    /// Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Receiver for decoded messages and the exit notification.
    ///
    /// Handed out exactly once; later calls return `None`.
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// Creates transports on demand (initial connect and reconnects).
pub trait KernelLauncher: Send {
    type Transport: KernelTransport + 'static;

    fn launch(&mut self) -> Pin<Box<dyn Future<Output = Result<Self::Transport>> + Send + '_>>;
}

/// How to start the bridge process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCommand {
    /// Executable, resolved through `PATH` when not a path.
    pub program: String,
    /// Script passed as the first argument; must exist at spawn time.
    pub script: Option<PathBuf>,
    pub args: Vec<String>,
}

impl KernelCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            script: None,
            args: Vec::new(),
        }
    }

    pub fn with_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn from_config(kernel: &KernelSection) -> Self {
        Self::new(kernel.python.clone())
            .with_script(kernel.bridge.clone())
            .with_args(kernel.args.iter().cloned())
    }
}

/// Launcher that spawns a real bridge subprocess per connection.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: KernelCommand,
}

impl ProcessLauncher {
    pub fn new(command: KernelCommand) -> Self {
        Self { command }
    }
}

impl KernelLauncher for ProcessLauncher {
    type Transport = ProcessTransport;

    fn launch(&mut self) -> Pin<Box<dyn Future<Output = Result<ProcessTransport>> + Send + '_>> {
        // Clone so the future doesn't borrow `self` across `await`.
        let command = self.command.clone();
        Box::pin(async move { ProcessTransport::spawn(&command) })
    }
}
