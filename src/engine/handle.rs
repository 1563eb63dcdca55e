// src/engine/handle.rs

use tokio::sync::{mpsc, oneshot};

use crate::errors::{CellRunnerError, Result};

use super::{Anchor, CoordinatorSnapshot, RuntimeEvent};

/// Capacity of the runtime command channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Create a handle and the receiver to build a [`super::Runtime`] with.
pub fn channel(capacity: usize) -> (CoordinatorHandle, mpsc::Receiver<RuntimeEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CoordinatorHandle { tx }, rx)
}

/// Cloneable front end of a running coordinator.
///
/// Every method fails with [`CellRunnerError::RuntimeStopped`] once the
/// runtime loop has ended.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<RuntimeEvent>,
}

impl CoordinatorHandle {
    /// Queue `code`; resolves to its sequence number.
    ///
    /// Fails when this submission had to connect and the connection failed.
    pub async fn submit(&self, code: impl Into<String>, anchor: Anchor) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(RuntimeEvent::Submit {
            code: code.into(),
            anchor,
            reply,
        })
        .await?;
        rx.await.map_err(|_| CellRunnerError::RuntimeStopped)?
    }

    pub async fn interrupt(&self, drop_queue: bool) -> Result<()> {
        self.send(RuntimeEvent::Interrupt { drop_queue }).await
    }

    pub async fn cancel_queue(&self) -> Result<()> {
        self.send(RuntimeEvent::CancelQueue).await
    }

    /// Restart the kernel, optionally switching to another kernel spec.
    pub async fn restart(&self, kernel: Option<String>) -> Result<()> {
        self.send(RuntimeEvent::Restart { kernel }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(RuntimeEvent::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(RuntimeEvent::Resume).await
    }

    pub async fn reply_stdin(&self, text: impl Into<String>) -> Result<()> {
        self.send(RuntimeEvent::ReplyStdin { text: text.into() }).await
    }

    /// Shut the kernel down and wait until the coordinator has reset.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(RuntimeEvent::Shutdown { reply }).await?;
        rx.await.map_err(|_| CellRunnerError::RuntimeStopped)
    }

    pub async fn exit_when_idle(&self) -> Result<()> {
        self.send(RuntimeEvent::ExitWhenIdle).await
    }

    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(RuntimeEvent::Snapshot { reply }).await?;
        rx.await.map_err(|_| CellRunnerError::RuntimeStopped)
    }

    /// Shut down and end the runtime loop.
    pub async fn stop(&self) -> Result<()> {
        self.send(RuntimeEvent::Stop).await
    }

    async fn send(&self, event: RuntimeEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CellRunnerError::RuntimeStopped)
    }
}
