// src/engine/event_handlers.rs

//! Handling of inbound kernel messages for the coordinator core.

use tracing::{debug, warn};

use crate::protocol::{Inbound, Outbound};
use crate::sink::{KernelError, KernelNotice, SinkUpdate};
use crate::stream::StreamEvent;

use super::CoordinatorState;
use super::core::Coordinator;

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Launch a transport; the shell reports back with `connected()` or
    /// `connection_failed()`.
    Connect,
    Send(Outbound),
    CloseTransport,
    Output(SinkUpdate),
    Stream(StreamCommand),
    Lifecycle(LifecycleEvent),
    /// The runtime loop should end after this step.
    RequestExit,
}

/// Instructions for the stream aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    Open(u64),
    Push(StreamEvent),
    /// Deliver everything batched so far, ahead of a non-stream update.
    Flush,
    Close(u64),
    Reset,
}

/// Notifications for lifecycle observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    StateChanged {
        from: CoordinatorState,
        to: CoordinatorState,
    },
    /// The kernel connection ended (shutdown, `bye` or process exit).
    Stopped,
}

/// Decision returned by the core after handling a single input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreStep {
    /// Commands the IO shell should execute, in order.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    pub fn new(commands: Vec<CoreCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }

    /// Messages this step sends to the kernel.
    pub fn sent(&self) -> impl Iterator<Item = &Outbound> {
        self.commands.iter().filter_map(|c| match c {
            CoreCommand::Send(message) => Some(message),
            _ => None,
        })
    }

    /// Sink updates this step produces directly.
    pub fn outputs(&self) -> impl Iterator<Item = &SinkUpdate> {
        self.commands.iter().filter_map(|c| match c {
            CoreCommand::Output(update) => Some(update),
            _ => None,
        })
    }
}

/// Dispatch one inbound message.
pub fn handle_message(core: &mut Coordinator, message: Inbound) -> CoreStep {
    let mut commands = Vec::new();

    match message {
        Inbound::Ready => handle_ready(core, &mut commands),
        Inbound::Stream { seq, name, text } => {
            commands.push(CoreCommand::Stream(StreamCommand::Push(StreamEvent::new(
                seq,
                name.unwrap_or_default(),
                text,
            ))));
        }
        Inbound::Result { seq, value } => {
            push_rich(&mut commands, SinkUpdate::Result { seq, text: value });
        }
        Inbound::Markdown { seq, value } => {
            push_rich(&mut commands, SinkUpdate::Markdown { seq, text: value });
        }
        Inbound::Image { seq, path } => {
            push_rich(&mut commands, SinkUpdate::Image { seq, path });
        }
        Inbound::Error {
            seq,
            ename,
            evalue,
            traceback,
        } => {
            let error = KernelError {
                ename,
                evalue,
                traceback,
            };
            match seq {
                Some(seq) => handle_error(core, seq, error, &mut commands),
                None => {
                    warn!(ename = %error.ename, evalue = %error.evalue, "bridge reported an error");
                    commands.push(CoreCommand::Output(SinkUpdate::Traceback { seq: None, error }));
                }
            }
        }
        Inbound::Done { seq } => handle_done(core, seq, &mut commands),
        Inbound::Interrupted => {
            let seq = core.queue().inflight_seq();
            debug!(?seq, "kernel acknowledged interrupt");
            commands.push(CoreCommand::Output(SinkUpdate::InterruptRequested { seq }));
        }
        Inbound::StdinRequest { prompt } => {
            commands.push(CoreCommand::Output(SinkUpdate::InputRequested { prompt }));
        }
        Inbound::Paused { message } => push_notice(&mut commands, KernelNotice::Paused(message)),
        Inbound::Resumed { message } => push_notice(&mut commands, KernelNotice::Resumed(message)),
        Inbound::PauseFailed { message } => {
            push_notice(&mut commands, KernelNotice::PauseFailed(message))
        }
        Inbound::ResumeFailed { message } => {
            push_notice(&mut commands, KernelNotice::ResumeFailed(message))
        }
        Inbound::Bye => {
            debug!("kernel said bye");
            core.reset_connection(&mut commands);
        }
    }

    core.finish_step(commands)
}

fn handle_ready(core: &mut Coordinator, commands: &mut Vec<CoreCommand>) {
    match core.state() {
        CoordinatorState::Connecting => {
            core.set_state(CoordinatorState::Ready, commands);
            core.dispatch_next(commands);
        }
        CoordinatorState::Disconnected => {
            warn!("ignoring ready while disconnected");
        }
        state => debug!(%state, "duplicate ready ignored"),
    }
}

/// Rich output goes after whatever stream text is still batched.
fn push_rich(commands: &mut Vec<CoreCommand>, update: SinkUpdate) {
    commands.push(CoreCommand::Stream(StreamCommand::Flush));
    commands.push(CoreCommand::Output(update));
}

fn push_notice(commands: &mut Vec<CoreCommand>, notice: KernelNotice) {
    commands.push(CoreCommand::Output(SinkUpdate::Notice(notice)));
}

fn handle_error(
    core: &mut Coordinator,
    seq: u64,
    error: KernelError,
    commands: &mut Vec<CoreCommand>,
) {
    debug!(seq, ename = %error.ename, "execution raised");

    let location = core.queue_mut().mark_errored(seq).map(|e| e.location());
    push_rich(commands, SinkUpdate::Traceback {
        seq: Some(seq),
        error,
    });
    if let Some(location) = location {
        commands.push(CoreCommand::Output(SinkUpdate::MarkError(location)));
    }

    if core.queue().inflight_seq() == Some(seq) {
        core.advance(commands);
    }
}

fn handle_done(core: &mut Coordinator, seq: u64, commands: &mut Vec<CoreCommand>) {
    commands.push(CoreCommand::Stream(StreamCommand::Close(seq)));

    match core.queue_mut().finalize(seq) {
        Some(entry) if !entry.errored => {
            commands.push(CoreCommand::Output(SinkUpdate::MarkSuccess(entry.location())));
        }
        Some(_) => debug!(seq, "errored execution finalised"),
        None => debug!(seq, "done for unknown sequence"),
    }

    if core.queue().inflight_seq() == Some(seq) {
        core.advance(commands);
    }
}
