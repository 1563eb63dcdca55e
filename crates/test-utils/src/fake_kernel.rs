use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cellrunner::errors::{CellRunnerError, Result};
use cellrunner::protocol::{Inbound, Outbound};
use cellrunner::transport::{KernelLauncher, KernelTransport, TransportEvent};
use tokio::sync::mpsc;

/// Computes the kernel's immediate replies to an outbound message.
pub type Responder = Box<dyn FnMut(&Outbound) -> Vec<Inbound> + Send>;

struct Shared {
    sent: Vec<Outbound>,
    launches: usize,
    closes: usize,
    fail_launches: bool,
    current: Option<mpsc::Sender<TransportEvent>>,
    responder: Option<Responder>,
}

/// A scripted kernel shared between a test and the runtime.
///
/// - records every outbound message
/// - answers through an optional responder
/// - lets the test inject inbound batches and process exits
#[derive(Clone)]
pub struct FakeKernel {
    shared: Arc<Mutex<Shared>>,
}

impl FakeKernel {
    /// A kernel that never answers on its own.
    pub fn silent() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                sent: Vec::new(),
                launches: 0,
                closes: 0,
                fail_launches: false,
                current: None,
                responder: None,
            })),
        }
    }

    pub fn with_responder(responder: impl FnMut(&Outbound) -> Vec<Inbound> + Send + 'static) -> Self {
        let kernel = Self::silent();
        kernel.shared.lock().unwrap().responder = Some(Box::new(responder));
        kernel
    }

    /// Answers `start`/`restart` with `ready`; everything else is up to the
    /// test.
    pub fn ready_only() -> Self {
        Self::with_responder(|message| match message {
            Outbound::Start { .. } | Outbound::Restart { .. } => vec![Inbound::Ready],
            _ => Vec::new(),
        })
    }

    /// Behaves like a well-mannered bridge: every execution finishes at once.
    pub fn standard() -> Self {
        Self::with_responder(|message| match message {
            Outbound::Start { .. } | Outbound::Restart { .. } => vec![Inbound::Ready],
            Outbound::Execute { seq, .. } => vec![Inbound::Done { seq: *seq }],
            Outbound::Interrupt => vec![Inbound::Interrupted],
            Outbound::Shutdown => vec![Inbound::Bye],
            _ => Vec::new(),
        })
    }

    pub fn launcher(&self) -> FakeLauncher {
        FakeLauncher {
            kernel: self.clone(),
        }
    }

    pub fn fail_launches(&self, fail: bool) {
        self.shared.lock().unwrap().fail_launches = fail;
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.shared.lock().unwrap().sent.clone()
    }

    /// Sequence numbers of `execute` messages, in send order.
    pub fn executed(&self) -> Vec<u64> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Execute { seq, .. } => Some(seq),
                _ => None,
            })
            .collect()
    }

    pub fn launches(&self) -> usize {
        self.shared.lock().unwrap().launches
    }

    pub fn closes(&self) -> usize {
        self.shared.lock().unwrap().closes
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().unwrap().current.is_some()
    }

    /// Deliver one batch, as if read from the bridge's stdout in one go.
    pub async fn emit(&self, messages: Vec<Inbound>) {
        let tx = self
            .shared
            .lock()
            .unwrap()
            .current
            .clone()
            .expect("no live fake transport to emit on");
        tx.send(TransportEvent::Messages(messages))
            .await
            .expect("runtime dropped the transport receiver");
    }

    /// Simulate the bridge process exiting on its own.
    pub async fn exit(&self, code: Option<i32>) {
        let tx = self.shared.lock().unwrap().current.take();
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Exited { code }).await;
        }
    }

    /// Wait until the recorded outbound messages satisfy `pred`.
    pub async fn wait_until(&self, pred: impl Fn(&[Outbound]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if pred(&self.shared.lock().unwrap().sent) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for outbound messages; sent so far: {:?}",
                self.sent()
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    pub async fn wait_for_executes(&self, count: usize) {
        self.wait_until(|sent| {
            sent.iter()
                .filter(|m| matches!(m, Outbound::Execute { .. }))
                .count()
                >= count
        })
        .await;
    }
}

/// Hands out [`FakeTransport`]s connected to a [`FakeKernel`].
pub struct FakeLauncher {
    kernel: FakeKernel,
}

impl KernelLauncher for FakeLauncher {
    type Transport = FakeTransport;

    fn launch(&mut self) -> Pin<Box<dyn Future<Output = Result<FakeTransport>> + Send + '_>> {
        let shared = Arc::clone(&self.kernel.shared);
        Box::pin(async move {
            let mut guard = shared.lock().unwrap();
            if guard.fail_launches {
                return Err(CellRunnerError::ConnectionFailed(
                    "fake launch failure".to_string(),
                ));
            }
            let (tx, rx) = mpsc::channel(64);
            guard.launches += 1;
            guard.current = Some(tx.clone());
            drop(guard);

            Ok(FakeTransport {
                shared,
                events_tx: tx,
                events_rx: Some(rx),
                closed: false,
            })
        })
    }
}

pub struct FakeTransport {
    shared: Arc<Mutex<Shared>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    closed: bool,
}

impl KernelTransport for FakeTransport {
    fn send(&mut self, message: &Outbound) {
        if self.closed {
            return;
        }
        let mut shared = self.shared.lock().unwrap();
        shared.sent.push(message.clone());
        let replies = match shared.responder.as_mut() {
            Some(responder) => responder(message),
            None => Vec::new(),
        };
        drop(shared);

        if !replies.is_empty() {
            let _ = self.events_tx.try_send(TransportEvent::Messages(replies));
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut shared = self.shared.lock().unwrap();
        shared.closes += 1;
        if shared
            .current
            .as_ref()
            .is_some_and(|tx| tx.same_channel(&self.events_tx))
        {
            shared.current = None;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.take()
    }
}
