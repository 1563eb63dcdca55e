// src/engine/runtime.rs

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::errors::{CellRunnerError, Result};
use crate::sink::{OutputSink, SinkUpdate};
use crate::stream::{StreamAggregator, StreamSettings};
use crate::transport::{KernelLauncher, KernelTransport, TransportEvent};

use super::core::Coordinator;
use super::{CoordinatorState, CoreCommand, CoreStep, LifecycleEvent, RuntimeEvent, StreamCommand};

/// Subscriber to coordinator lifecycle notifications.
pub trait LifecycleObserver: Send {
    fn on_state_change(&mut self, _from: CoordinatorState, _to: CoordinatorState) {}

    /// The kernel connection ended.
    fn on_stop(&mut self) {}
}

/// Result of applying one core step.
struct Applied {
    keep_running: bool,
    connect_error: Option<CellRunnerError>,
}

/// Drives the [`Coordinator`] in response to caller commands and transport
/// events, and owns everything that does IO: the transport, the sink and
/// the aggregator's timers.
///
/// This is a pure IO shell around the coordinator, which contains all the
/// execution semantics.
pub struct Runtime<L: KernelLauncher, S: OutputSink> {
    core: Coordinator,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    launcher: L,
    transport: Option<L::Transport>,
    transport_rx: Option<mpsc::Receiver<TransportEvent>>,
    /// Bumped whenever the transport is replaced or closed.
    generation: u64,
    aggregator: StreamAggregator,
    /// Rate window timer; only exists while streams are open.
    rate_tick: Option<Interval>,
    sink: S,
    observers: Vec<Box<dyn LifecycleObserver>>,
}

impl<L: KernelLauncher, S: OutputSink> fmt::Debug for Runtime<L, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("connected", &self.transport.is_some())
            .field("generation", &self.generation)
            .field("aggregator", &self.aggregator)
            .finish_non_exhaustive()
    }
}

impl<L: KernelLauncher, S: OutputSink> Runtime<L, S> {
    pub fn new(
        core: Coordinator,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        launcher: L,
        sink: S,
        settings: StreamSettings,
    ) -> Self {
        Self {
            core,
            event_rx,
            launcher,
            transport: None,
            transport_rx: None,
            generation: 0,
            aggregator: StreamAggregator::new(settings),
            rate_tick: None,
            sink,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: impl LifecycleObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Main event loop.
    ///
    /// - Consumes `RuntimeEvent`s from `event_rx`.
    /// - Consumes decoded message batches from the current transport.
    /// - Drives the aggregator's rate window and flush deadline.
    pub async fn run(mut self) -> Result<()> {
        info!("cellrunner runtime started");

        loop {
            let deadline = self.aggregator.next_deadline();

            let keep_running = tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("runtime event channel closed; exiting");
                        let step = self.core.stop();
                        self.apply(step).await;
                        false
                    }
                },
                event = next_transport_event(&mut self.transport_rx) => {
                    self.handle_transport_event(event).await
                }
                _ = next_tick(&mut self.rate_tick) => {
                    self.on_rate_tick();
                    true
                }
                _ = flush_at(deadline) => {
                    let updates = self.aggregator.poll(now());
                    self.deliver(updates);
                    true
                }
            };

            if !keep_running {
                info!("core requested exit; stopping runtime");
                break;
            }
        }

        self.close_transport();
        self.rate_tick = None;
        info!("runtime exiting");
        Ok(())
    }

    async fn handle_event(&mut self, event: RuntimeEvent) -> bool {
        match event {
            RuntimeEvent::Submit {
                code,
                anchor,
                reply,
            } => {
                let (seq, step) = self.core.submit(code, anchor);
                let applied = self.apply(step).await;
                let result = match applied.connect_error {
                    Some(e) => Err(e),
                    None => Ok(seq),
                };
                let _ = reply.send(result);
                applied.keep_running
            }
            RuntimeEvent::Interrupt { drop_queue } => {
                let step = self.core.interrupt(drop_queue);
                self.apply(step).await.keep_running
            }
            RuntimeEvent::CancelQueue => {
                let step = self.core.cancel_queue();
                self.apply(step).await.keep_running
            }
            RuntimeEvent::Restart { kernel } => {
                let step = self.core.restart(kernel);
                self.apply(step).await.keep_running
            }
            RuntimeEvent::Pause => {
                let step = self.core.pause();
                self.apply(step).await.keep_running
            }
            RuntimeEvent::Resume => {
                let step = self.core.resume();
                self.apply(step).await.keep_running
            }
            RuntimeEvent::ReplyStdin { text } => {
                let step = self.core.reply_stdin(text);
                self.apply(step).await.keep_running
            }
            RuntimeEvent::Shutdown { reply } => {
                let step = self.core.shutdown();
                let keep_running = self.apply(step).await.keep_running;
                let _ = reply.send(());
                keep_running
            }
            RuntimeEvent::ExitWhenIdle => {
                let step = self.core.exit_when_idle();
                self.apply(step).await.keep_running
            }
            RuntimeEvent::Snapshot { reply } => {
                let _ = reply.send(self.core.snapshot());
                true
            }
            RuntimeEvent::Stop => {
                let step = self.core.stop();
                self.apply(step).await.keep_running
            }
        }
    }

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) -> bool {
        match event {
            Some(TransportEvent::Messages(messages)) => {
                let generation = self.generation;
                for message in messages {
                    if self.generation != generation {
                        debug!("transport replaced; dropping rest of batch");
                        break;
                    }
                    let step = self.core.handle_message(message);
                    if !self.apply(step).await.keep_running {
                        return false;
                    }
                }
                true
            }
            Some(TransportEvent::Exited { code }) => {
                self.close_transport();
                let step = self.core.transport_lost(code);
                self.apply(step).await.keep_running
            }
            None => {
                debug!("transport event channel closed");
                self.close_transport();
                let step = self.core.transport_lost(None);
                self.apply(step).await.keep_running
            }
        }
    }

    /// Execute a step's commands in order, including follow-up steps from
    /// connecting.
    async fn apply(&mut self, step: CoreStep) -> Applied {
        let mut keep_running = step.keep_running;
        let mut connect_error = None;
        let mut commands: VecDeque<CoreCommand> = step.commands.into();

        while let Some(command) = commands.pop_front() {
            if !matches!(command, CoreCommand::Connect) {
                self.execute(command);
                continue;
            }

            let follow_up = match self.connect().await {
                Ok(()) => self.core.connected(),
                Err(e) => {
                    warn!(error = %e, "failed to connect to kernel");
                    connect_error = Some(e);
                    self.core.connection_failed()
                }
            };
            keep_running &= follow_up.keep_running;
            for command in follow_up.commands.into_iter().rev() {
                commands.push_front(command);
            }
        }

        Applied {
            keep_running,
            connect_error,
        }
    }

    fn execute(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::Connect => debug!("connect handled by apply"),
            CoreCommand::Send(message) => match self.transport.as_mut() {
                Some(transport) => transport.send(&message),
                None => debug!(kind = message.kind(), "no transport; dropping outbound message"),
            },
            CoreCommand::CloseTransport => self.close_transport(),
            CoreCommand::Output(update) => update.apply(&mut self.sink),
            CoreCommand::Stream(command) => self.stream(command),
            CoreCommand::Lifecycle(event) => self.notify(event),
            CoreCommand::RequestExit => debug!("core issued RequestExit command"),
        }
    }

    fn stream(&mut self, command: StreamCommand) {
        let updates = match command {
            StreamCommand::Open(seq) => {
                self.aggregator.open(seq);
                self.ensure_rate_tick();
                return;
            }
            StreamCommand::Push(event) => self.aggregator.push(event, now()),
            StreamCommand::Flush => self.aggregator.flush(),
            StreamCommand::Close(seq) => self.aggregator.close(seq),
            StreamCommand::Reset => {
                self.rate_tick = None;
                self.aggregator.reset()
            }
        };
        self.deliver(updates);
    }

    fn deliver(&mut self, updates: Vec<SinkUpdate>) {
        for update in &updates {
            update.apply(&mut self.sink);
        }
    }

    fn notify(&mut self, event: LifecycleEvent) {
        for observer in &mut self.observers {
            match event {
                LifecycleEvent::StateChanged { from, to } => observer.on_state_change(from, to),
                LifecycleEvent::Stopped => observer.on_stop(),
            }
        }
    }

    fn ensure_rate_tick(&mut self) {
        if self.rate_tick.is_some() {
            return;
        }
        let period = self.aggregator.settings().rate_window;
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.rate_tick = Some(interval);
        debug!(?period, "rate timer started");
    }

    fn on_rate_tick(&mut self) {
        let updates = self.aggregator.tick(now());
        self.deliver(updates);
        if self.aggregator.is_idle() {
            self.rate_tick = None;
            self.aggregator.reset_rate();
            debug!("rate timer released");
        }
    }

    async fn connect(&mut self) -> Result<()> {
        self.close_transport();

        let mut transport = self.launcher.launch().await?;
        let events = transport.take_events().ok_or_else(|| {
            CellRunnerError::ConnectionFailed("transport events already taken".to_string())
        })?;

        self.generation += 1;
        self.transport = Some(transport);
        self.transport_rx = Some(events);
        debug!(generation = self.generation, "transport connected");
        Ok(())
    }

    fn close_transport(&mut self) {
        self.transport_rx = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            self.generation += 1;
        }
    }
}

/// Clock shared with Tokio, so paused-time tests see consistent instants.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn next_transport_event(
    rx: &mut Option<mpsc::Receiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn flush_at(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}
