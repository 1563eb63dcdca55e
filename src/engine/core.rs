// src/engine/core.rs

//! Pure coordinator state machine.
//!
//! This module contains a synchronous, deterministic coordinator that
//! consumes caller operations and kernel messages and produces:
//! - an updated coordinator state
//! - a list of commands describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - launching and closing transports
//! - feeding the stream aggregator and owning its timers
//! - applying sink updates and notifying lifecycle observers
//!
//! The core is intended to be extensively unit tested without any Tokio,
//! channels, or processes.

use tracing::{debug, info, warn};

use crate::protocol::{Inbound, Outbound};
use crate::sink::SinkUpdate;
use crate::types::RestartQueuePolicy;

use super::event_handlers::{CoreCommand, CoreStep, LifecycleEvent, StreamCommand, handle_message};
use super::queue::{ExecutionQueue, ExecutionRequest, PendingEntry};
use super::{Anchor, CoordinatorSnapshot, CoordinatorState, KernelSpec, RuntimeOptions};

/// Coordinator for one kernel.
///
/// This owns:
/// - the connection state
/// - the sequence counter
/// - the execution queue and pending entries
///
/// It has **no** channels, no Tokio types, and does not perform any IO.
#[derive(Debug)]
pub struct Coordinator {
    state: CoordinatorState,
    next_seq: u64,
    queue: ExecutionQueue,
    kernel: KernelSpec,
    restart_policy: RestartQueuePolicy,
    options: RuntimeOptions,
}

impl Coordinator {
    pub fn new(kernel: KernelSpec, restart_policy: RestartQueuePolicy, options: RuntimeOptions) -> Self {
        Self {
            state: CoordinatorState::Disconnected,
            next_seq: 1,
            queue: ExecutionQueue::new(),
            kernel,
            restart_policy,
            options,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn kernel(&self) -> &KernelSpec {
        &self.kernel
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut ExecutionQueue {
        &mut self.queue
    }

    /// Nothing queued, nothing in flight, nothing waiting to be finalised.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            state: self.state,
            queued: self.queue.len(),
            inflight: self.queue.inflight_seq(),
            pending: self.queue.pending_sequences(),
        }
    }

    /// Queue `code` for execution and return its sequence number.
    ///
    /// Connects first when disconnected; the request is dispatched once the
    /// kernel reports `ready`.
    pub fn submit(&mut self, code: impl Into<String>, anchor: Anchor) -> (u64, CoreStep) {
        let sequence = self.next_seq;
        self.next_seq += 1;

        self.queue.push(
            ExecutionRequest {
                sequence,
                code: code.into(),
                anchor_line: anchor.anchor_line,
                start_line: anchor.start_line,
            },
            anchor.buffer,
        );
        debug!(seq = sequence, state = %self.state, queued = self.queue.len(), "request submitted");

        let mut commands = Vec::new();
        match self.state {
            CoordinatorState::Disconnected => {
                self.set_state(CoordinatorState::Connecting, &mut commands);
                commands.push(CoreCommand::Connect);
            }
            CoordinatorState::Ready => self.dispatch_next(&mut commands),
            CoordinatorState::Connecting | CoordinatorState::Busy => {}
        }

        (sequence, CoreStep::new(commands))
    }

    /// The shell launched a transport for a `Connect` command.
    pub fn connected(&mut self) -> CoreStep {
        info!(kernel = %self.kernel.name, "transport up; starting kernel");
        let mut commands = Vec::new();
        if self.state == CoordinatorState::Disconnected {
            self.set_state(CoordinatorState::Connecting, &mut commands);
        }
        commands.push(CoreCommand::Send(Outbound::Start {
            kernel: self.kernel.name.clone(),
            cwd: self.kernel.cwd.clone(),
        }));
        CoreStep::new(commands)
    }

    /// Launching the transport failed. Leaves no ghost requests behind.
    pub fn connection_failed(&mut self) -> CoreStep {
        let mut commands = Vec::new();
        for entry in self.queue.clear() {
            commands.push(CoreCommand::Output(SinkUpdate::ClearLocation(entry.location())));
        }
        self.set_state(CoordinatorState::Disconnected, &mut commands);
        self.finish_step(commands)
    }

    /// The transport's process went away without `bye`.
    pub fn transport_lost(&mut self, code: Option<i32>) -> CoreStep {
        let mut commands = Vec::new();
        if self.state == CoordinatorState::Disconnected {
            debug!(?code, "transport exit while already disconnected");
        } else {
            warn!(?code, "kernel bridge exited unexpectedly");
            self.reset_connection(&mut commands);
        }
        self.finish_step(commands)
    }

    pub fn handle_message(&mut self, message: Inbound) -> CoreStep {
        handle_message(self, message)
    }

    /// Ask the kernel to interrupt; optionally discard everything queued
    /// behind the in-flight request first.
    pub fn interrupt(&mut self, drop_queue: bool) -> CoreStep {
        let mut commands = Vec::new();
        if drop_queue {
            let dropped = self.queue.drop_queued();
            clear_entries(&dropped, &mut commands);
        }
        if self.state == CoordinatorState::Disconnected {
            debug!("interrupt while disconnected; nothing to signal");
        } else {
            commands.push(CoreCommand::Send(Outbound::Interrupt));
        }
        self.finish_step(commands)
    }

    /// Discard queued requests; the in-flight one keeps running.
    pub fn cancel_queue(&mut self) -> CoreStep {
        let mut commands = Vec::new();
        let dropped = self.queue.drop_queued();
        clear_entries(&dropped, &mut commands);
        self.finish_step(commands)
    }

    /// Best-effort kernel shutdown and full reset. Always succeeds.
    pub fn shutdown(&mut self) -> CoreStep {
        let mut commands = Vec::new();
        if self.state != CoordinatorState::Disconnected {
            commands.push(CoreCommand::Send(Outbound::Shutdown));
        }
        self.reset_connection(&mut commands);
        CoreStep::new(commands)
    }

    /// [`Coordinator::shutdown`] and end the runtime.
    pub fn stop(&mut self) -> CoreStep {
        let mut step = self.shutdown();
        step.commands.push(CoreCommand::RequestExit);
        step.keep_running = false;
        step
    }

    /// Restart the kernel behind the existing transport.
    ///
    /// The in-flight request is released (the bridge abandons it); queued
    /// requests follow the restart policy. Dispatch resumes on `ready`.
    pub fn restart(&mut self, kernel: Option<String>) -> CoreStep {
        let mut commands = Vec::new();
        if let Some(name) = kernel {
            self.kernel.name = name;
        }
        if self.state == CoordinatorState::Disconnected {
            debug!("restart while disconnected; nothing to restart");
            return CoreStep::new(commands);
        }

        if let Some(entry) = self.queue.release_inflight() {
            commands.push(CoreCommand::Stream(StreamCommand::Close(entry.sequence)));
            commands.push(CoreCommand::Output(SinkUpdate::ClearLocation(entry.location())));
        }
        // The fresh kernel never sends `done` for requests that already left the queue.
        for entry in self.queue.release_detached() {
            debug!(seq = entry.sequence, errored = entry.errored, "releasing unfinished entry");
            commands.push(CoreCommand::Stream(StreamCommand::Close(entry.sequence)));
            commands.push(CoreCommand::Output(SinkUpdate::ClearLocation(entry.location())));
        }
        if self.restart_policy == RestartQueuePolicy::Drain {
            let dropped = self.queue.drop_queued();
            clear_entries(&dropped, &mut commands);
        }

        info!(kernel = %self.kernel.name, policy = ?self.restart_policy, "restarting kernel");
        commands.push(CoreCommand::Send(Outbound::Restart {
            kernel: self.kernel.name.clone(),
            cwd: self.kernel.cwd.clone(),
        }));
        self.set_state(CoordinatorState::Connecting, &mut commands);
        CoreStep::new(commands)
    }

    pub fn pause(&mut self) -> CoreStep {
        self.send_if_connected(Outbound::Pause)
    }

    pub fn resume(&mut self) -> CoreStep {
        self.send_if_connected(Outbound::Resume)
    }

    pub fn reply_stdin(&mut self, text: impl Into<String>) -> CoreStep {
        self.send_if_connected(Outbound::StdinReply { text: text.into() })
    }

    /// Enable exit-when-idle; stops right away when already idle.
    pub fn exit_when_idle(&mut self) -> CoreStep {
        self.options.exit_when_idle = true;
        self.finish_step(Vec::new())
    }

    fn send_if_connected(&mut self, message: Outbound) -> CoreStep {
        if self.state == CoordinatorState::Disconnected {
            debug!(kind = message.kind(), "not connected; dropping request");
            return CoreStep::new(Vec::new());
        }
        CoreStep::new(vec![CoreCommand::Send(message)])
    }

    pub(crate) fn set_state(&mut self, to: CoordinatorState, commands: &mut Vec<CoreCommand>) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!(%from, %to, "coordinator state changed");
        commands.push(CoreCommand::Lifecycle(LifecycleEvent::StateChanged { from, to }));
    }

    /// Dispatch the queue head when ready and nothing is in flight.
    pub(crate) fn dispatch_next(&mut self, commands: &mut Vec<CoreCommand>) {
        if self.state != CoordinatorState::Ready {
            return;
        }
        let Some(request) = self.queue.dispatch_next() else {
            return;
        };
        let seq = request.sequence;
        debug!(seq, "dispatching request");

        commands.push(CoreCommand::Stream(StreamCommand::Open(seq)));
        commands.push(CoreCommand::Output(SinkUpdate::OpenSection { seq }));
        if let Some(entry) = self.queue.pending(seq) {
            commands.push(CoreCommand::Output(SinkUpdate::MarkRunning(entry.location())));
        }
        commands.push(CoreCommand::Send(Outbound::Execute {
            code: request.code,
            seq,
        }));
        self.set_state(CoordinatorState::Busy, commands);
    }

    /// The in-flight request ended: pop it and dispatch the next one.
    pub(crate) fn advance(&mut self, commands: &mut Vec<CoreCommand>) {
        self.queue.complete_head();
        if self.state == CoordinatorState::Busy {
            self.set_state(CoordinatorState::Ready, commands);
        }
        self.dispatch_next(commands);
    }

    /// Connection loss: close the transport and forget everything.
    pub(crate) fn reset_connection(&mut self, commands: &mut Vec<CoreCommand>) {
        let released = self.queue.clear();
        if !released.is_empty() {
            debug!(count = released.len(), "released pending requests");
        }
        commands.push(CoreCommand::CloseTransport);
        commands.push(CoreCommand::Stream(StreamCommand::Reset));
        commands.push(CoreCommand::Output(SinkUpdate::ClearAll));
        let was_connected = self.state != CoordinatorState::Disconnected;
        self.set_state(CoordinatorState::Disconnected, commands);
        if was_connected {
            commands.push(CoreCommand::Lifecycle(LifecycleEvent::Stopped));
        }
    }

    /// Wrap up a step, shutting down when idle and asked to exit.
    pub(crate) fn finish_step(&mut self, mut commands: Vec<CoreCommand>) -> CoreStep {
        if !(self.options.exit_when_idle && self.is_idle()) {
            return CoreStep::new(commands);
        }

        info!("coordinator idle; stopping");
        if self.state != CoordinatorState::Disconnected {
            commands.push(CoreCommand::Send(Outbound::Shutdown));
            self.reset_connection(&mut commands);
        }
        commands.push(CoreCommand::RequestExit);
        CoreStep {
            commands,
            keep_running: false,
        }
    }
}

fn clear_entries(entries: &[PendingEntry], commands: &mut Vec<CoreCommand>) {
    for entry in entries {
        debug!(seq = entry.sequence, "discarding queued request");
        commands.push(CoreCommand::Output(SinkUpdate::ClearLocation(entry.location())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Coordinator {
        Coordinator::new(
            KernelSpec::new("python3"),
            RestartQueuePolicy::Drain,
            RuntimeOptions::default(),
        )
    }

    fn ready(core: &mut Coordinator) {
        core.connected();
        core.handle_message(Inbound::Ready);
    }

    fn executes(step: &CoreStep) -> Vec<u64> {
        step.sent()
            .filter_map(|m| match m {
                Outbound::Execute { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn submit_while_disconnected_connects_and_queues() {
        let mut core = coordinator();
        let (seq, step) = core.submit("x = 1", Anchor::at_line(0));

        assert_eq!(seq, 1);
        assert!(step.commands.contains(&CoreCommand::Connect));
        assert!(executes(&step).is_empty());
        assert_eq!(core.state(), CoordinatorState::Connecting);

        // A second submission does not connect twice.
        let (_, step) = core.submit("x = 2", Anchor::at_line(1));
        assert!(!step.commands.contains(&CoreCommand::Connect));
    }

    #[test]
    fn connected_sends_start_and_ready_dispatches_head() {
        let mut core = coordinator();
        core.submit("a", Anchor::at_line(0));
        core.submit("b", Anchor::at_line(1));

        let step = core.connected();
        assert_eq!(
            step.sent().collect::<Vec<_>>(),
            vec![&Outbound::Start {
                kernel: "python3".into(),
                cwd: None
            }]
        );

        let step = core.handle_message(Inbound::Ready);
        assert_eq!(executes(&step), vec![1]);
        assert_eq!(core.state(), CoordinatorState::Busy);
    }

    #[test]
    fn done_advances_queue_and_marks_success() {
        let mut core = coordinator();
        ready(&mut core);
        core.submit("a", Anchor::at_line(3));
        core.submit("b", Anchor::at_line(7));

        let step = core.handle_message(Inbound::Done { seq: 1 });
        assert_eq!(
            step.commands.first(),
            Some(&CoreCommand::Stream(StreamCommand::Close(1)))
        );
        assert!(step
            .outputs()
            .any(|u| matches!(u, SinkUpdate::MarkSuccess(loc) if loc.line == 3)));
        assert_eq!(executes(&step), vec![2]);
    }

    #[test]
    fn error_then_done_suppresses_success() {
        let mut core = coordinator();
        ready(&mut core);
        core.submit("a", Anchor::at_line(0));
        core.submit("b", Anchor::at_line(1));

        let step = core.handle_message(Inbound::Error {
            seq: Some(1),
            ename: "ValueError".into(),
            evalue: "bad".into(),
            traceback: String::new(),
        });
        assert!(step.outputs().any(|u| matches!(u, SinkUpdate::MarkError(_))));
        assert_eq!(executes(&step), vec![2]);

        let step = core.handle_message(Inbound::Done { seq: 1 });
        assert!(!step.outputs().any(|u| matches!(u, SinkUpdate::MarkSuccess(_))));
        assert!(executes(&step).is_empty());
        assert_eq!(core.queue().inflight_seq(), Some(2));

        let step = core.handle_message(Inbound::Done { seq: 2 });
        assert!(step.outputs().any(|u| matches!(u, SinkUpdate::MarkSuccess(_))));
        assert!(core.is_idle());
        assert_eq!(core.state(), CoordinatorState::Ready);
    }

    #[test]
    fn error_without_seq_leaves_queue_alone() {
        let mut core = coordinator();
        ready(&mut core);
        core.submit("a", Anchor::at_line(0));

        let step = core.handle_message(Inbound::Error {
            seq: None,
            ename: "JSONDecodeError".into(),
            evalue: "oops".into(),
            traceback: String::new(),
        });
        assert!(step
            .outputs()
            .any(|u| matches!(u, SinkUpdate::Traceback { seq: None, .. })));
        assert_eq!(core.queue().inflight_seq(), Some(1));
    }

    #[test]
    fn interrupt_drop_queue_keeps_inflight() {
        let mut core = coordinator();
        for line in 0..3 {
            core.submit("x", Anchor::at_line(line));
        }
        ready(&mut core);

        let step = core.interrupt(true);
        let cleared: Vec<usize> = step
            .outputs()
            .filter_map(|u| match u {
                SinkUpdate::ClearLocation(loc) => Some(loc.line),
                _ => None,
            })
            .collect();
        assert_eq!(cleared, vec![1, 2]);
        assert!(step.sent().any(|m| *m == Outbound::Interrupt));
        assert_eq!(core.queue().pending_sequences(), vec![1]);
    }

    #[test]
    fn interrupted_notifies_sink_for_inflight_head() {
        let mut core = coordinator();
        ready(&mut core);
        core.submit("x", Anchor::at_line(0));

        let step = core.handle_message(Inbound::Interrupted);
        assert_eq!(
            step.outputs().collect::<Vec<_>>(),
            vec![&SinkUpdate::InterruptRequested { seq: Some(1) }]
        );
        assert_eq!(core.queue().inflight_seq(), Some(1));
    }

    #[test]
    fn cancel_queue_does_not_send_anything() {
        let mut core = coordinator();
        ready(&mut core);
        core.submit("a", Anchor::at_line(0));
        core.submit("b", Anchor::at_line(1));

        let step = core.cancel_queue();
        assert_eq!(step.sent().count(), 0);
        assert_eq!(core.queue().len(), 1);
    }

    #[test]
    fn bye_resets_everything() {
        let mut core = coordinator();
        ready(&mut core);
        core.submit("a", Anchor::at_line(0));
        core.submit("b", Anchor::at_line(1));

        let step = core.handle_message(Inbound::Bye);
        assert!(step.commands.contains(&CoreCommand::CloseTransport));
        assert!(step.outputs().any(|u| *u == SinkUpdate::ClearAll));
        assert!(step
            .commands
            .contains(&CoreCommand::Lifecycle(LifecycleEvent::Stopped)));
        assert_eq!(core.state(), CoordinatorState::Disconnected);
        assert!(core.is_idle());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut core = coordinator();
        ready(&mut core);
        core.submit("a", Anchor::at_line(0));

        let first = core.shutdown();
        assert!(first.sent().any(|m| *m == Outbound::Shutdown));
        let second = core.shutdown();
        assert_eq!(second.sent().count(), 0);
        assert_eq!(core.state(), CoordinatorState::Disconnected);
        assert!(core.is_idle());
    }

    #[test]
    fn connection_failure_leaves_no_ghost_requests() {
        let mut core = coordinator();
        core.submit("a", Anchor::at_line(0));
        core.submit("b", Anchor::at_line(1));

        core.connection_failed();
        assert_eq!(core.state(), CoordinatorState::Disconnected);
        assert!(core.is_idle());

        // Sequence numbers are never reused.
        let (seq, _) = core.submit("c", Anchor::at_line(2));
        assert_eq!(seq, 3);
    }

    #[test]
    fn restart_drains_queue_and_waits_for_ready() {
        let mut core = coordinator();
        ready(&mut core);
        core.submit("a", Anchor::at_line(0));
        core.submit("b", Anchor::at_line(1));

        let step = core.restart(None);
        assert!(step.sent().any(|m| matches!(m, Outbound::Restart { .. })));
        assert_eq!(core.state(), CoordinatorState::Connecting);
        assert!(core.is_idle());

        core.handle_message(Inbound::Ready);
        assert_eq!(core.state(), CoordinatorState::Ready);
    }

    #[test]
    fn restart_releases_errored_entry_still_waiting_for_done() {
        let mut core = coordinator();
        ready(&mut core);
        core.submit("a", Anchor::at_line(0));
        core.submit("b", Anchor::at_line(1));

        let step = core.handle_message(Inbound::Error {
            seq: Some(1),
            ename: "ValueError".into(),
            evalue: "bad".into(),
            traceback: String::new(),
        });
        assert_eq!(executes(&step), vec![2]);

        let step = core.restart(None);
        assert!(step
            .commands
            .contains(&CoreCommand::Stream(StreamCommand::Close(1))));
        assert!(core.queue().pending_sequences().is_empty());

        core.handle_message(Inbound::Ready);
        assert!(core.is_idle());
        let step = core.exit_when_idle();
        assert!(!step.keep_running);
    }

    #[test]
    fn restart_with_keep_policy_redispatches_after_ready() {
        let mut core = Coordinator::new(
            KernelSpec::new("python3"),
            RestartQueuePolicy::Keep,
            RuntimeOptions::default(),
        );
        ready(&mut core);
        core.submit("a", Anchor::at_line(0));
        core.submit("b", Anchor::at_line(1));

        let step = core.restart(Some("julia".into()));
        assert!(step.sent().any(|m| matches!(
            m,
            Outbound::Restart { kernel, .. } if kernel == "julia"
        )));
        assert_eq!(core.queue().pending_sequences(), vec![2]);

        let step = core.handle_message(Inbound::Ready);
        assert_eq!(executes(&step), vec![2]);
    }

    #[test]
    fn exit_when_idle_stops_after_last_done() {
        let mut core = coordinator();
        ready(&mut core);
        core.submit("a", Anchor::at_line(0));

        let step = core.exit_when_idle();
        assert!(step.keep_running);

        let step = core.handle_message(Inbound::Done { seq: 1 });
        assert!(!step.keep_running);
        assert!(step.sent().any(|m| *m == Outbound::Shutdown));
        assert_eq!(step.commands.last(), Some(&CoreCommand::RequestExit));
    }

    #[test]
    fn state_changes_are_reported() {
        let mut core = coordinator();
        let (_, step) = core.submit("a", Anchor::at_line(0));
        assert!(step.commands.contains(&CoreCommand::Lifecycle(
            LifecycleEvent::StateChanged {
                from: CoordinatorState::Disconnected,
                to: CoordinatorState::Connecting,
            }
        )));
    }
}
