use std::collections::VecDeque;

use cellrunner::engine::{Anchor, Coordinator, CoordinatorState, CoreCommand, CoreStep, KernelSpec, RuntimeOptions};
use cellrunner::protocol::{Inbound, Outbound};
use cellrunner::types::RestartQueuePolicy;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Submit,
    Ready,
    Finish { errored: bool },
    Interrupt { drop_queue: bool },
    CancelQueue,
    Restart,
    Bye,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Submit),
        2 => Just(Op::Ready),
        4 => any::<bool>().prop_map(|errored| Op::Finish { errored }),
        1 => any::<bool>().prop_map(|drop_queue| Op::Interrupt { drop_queue }),
        1 => Just(Op::CancelQueue),
        1 => Just(Op::Restart),
        1 => Just(Op::Bye),
    ]
}

/// The kernel side of the conversation, as far as the properties care.
#[derive(Debug, Default)]
struct Kernel {
    connected: bool,
    awaiting_ready: bool,
    executing: Option<u64>,
    executed: Vec<u64>,
}

impl Kernel {
    /// Play a step's commands the way the runtime would, connecting inline.
    fn apply(&mut self, core: &mut Coordinator, step: CoreStep) -> Result<(), TestCaseError> {
        let mut commands: VecDeque<CoreCommand> = step.commands.into();
        let mut executes_this_step = 0;
        while let Some(command) = commands.pop_front() {
            match command {
                CoreCommand::Connect => {
                    self.connected = true;
                    let follow_up = core.connected();
                    for c in follow_up.commands.into_iter().rev() {
                        commands.push_front(c);
                    }
                }
                CoreCommand::Send(Outbound::Start { .. }) => self.awaiting_ready = true,
                CoreCommand::Send(Outbound::Restart { .. }) => {
                    self.awaiting_ready = true;
                    self.executing = None;
                }
                CoreCommand::Send(Outbound::Execute { seq, .. }) => {
                    executes_this_step += 1;
                    prop_assert!(self.executing.is_none(), "execute {} while {:?} runs", seq, self.executing);
                    if let Some(last) = self.executed.last() {
                        prop_assert!(seq > *last, "execute {} after {}", seq, last);
                    }
                    self.executing = Some(seq);
                    self.executed.push(seq);
                }
                CoreCommand::CloseTransport => {
                    self.connected = false;
                    self.awaiting_ready = false;
                    self.executing = None;
                }
                _ => {}
            }
        }
        prop_assert!(executes_this_step <= 1);
        Ok(())
    }
}

proptest! {
    #[test]
    fn at_most_one_request_in_flight(
        ops in proptest::collection::vec(op(), 1..80),
        keep in any::<bool>(),
    ) {
        let policy = if keep { RestartQueuePolicy::Keep } else { RestartQueuePolicy::Drain };
        let mut core = Coordinator::new(KernelSpec::new("python3"), policy, RuntimeOptions::default());
        let mut kernel = Kernel::default();
        let mut last_seq = 0;

        for (line, op) in ops.into_iter().enumerate() {
            match op {
                Op::Submit => {
                    let (seq, step) = core.submit(format!("cell_{line}()"), Anchor::at_line(line));
                    prop_assert!(seq > last_seq);
                    last_seq = seq;
                    kernel.apply(&mut core, step)?;
                }
                Op::Ready => {
                    if kernel.awaiting_ready {
                        kernel.awaiting_ready = false;
                        let step = core.handle_message(Inbound::Ready);
                        kernel.apply(&mut core, step)?;
                    }
                }
                Op::Finish { errored } => {
                    if let Some(seq) = kernel.executing.take() {
                        if errored {
                            let step = core.handle_message(Inbound::Error {
                                seq: Some(seq),
                                ename: "ValueError".into(),
                                evalue: String::new(),
                                traceback: String::new(),
                            });
                            kernel.apply(&mut core, step)?;
                        }
                        let step = core.handle_message(Inbound::Done { seq });
                        kernel.apply(&mut core, step)?;
                    }
                }
                Op::Interrupt { drop_queue } => {
                    let step = core.interrupt(drop_queue);
                    kernel.apply(&mut core, step)?;
                }
                Op::CancelQueue => {
                    let step = core.cancel_queue();
                    kernel.apply(&mut core, step)?;
                }
                Op::Restart => {
                    let step = core.restart(None);
                    kernel.apply(&mut core, step)?;
                }
                Op::Bye => {
                    if kernel.connected {
                        let step = core.handle_message(Inbound::Bye);
                        kernel.apply(&mut core, step)?;
                    }
                }
            }

            let snapshot = core.snapshot();
            prop_assert_eq!(snapshot.inflight, kernel.executing);
            prop_assert_eq!(
                snapshot.state == CoordinatorState::Busy,
                snapshot.inflight.is_some()
            );
            if snapshot.state == CoordinatorState::Disconnected {
                prop_assert_eq!(snapshot.queued, 0);
                prop_assert!(snapshot.pending.is_empty());
            }
        }
    }
}
