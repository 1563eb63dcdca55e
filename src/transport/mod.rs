// src/transport/mod.rs

//! Framed transport to the kernel bridge subprocess.
//!
//! - [`backend`] provides the `KernelTransport` / `KernelLauncher` traits the
//!   runtime talks to, so tests can swap in a scripted fake kernel.
//! - [`process`] is the production implementation on top of
//!   `tokio::process::Command`: it owns the child's three pipes and its
//!   process handle, and turns stdout into batches of decoded messages.

pub mod backend;
pub mod process;

pub use backend::{KernelCommand, KernelLauncher, KernelTransport, ProcessLauncher, TransportEvent};
pub use process::ProcessTransport;
