//! Receiver side of one offer/answer/ICE exchange.

use super::{NegotiationAction, NegotiationEvent, NegotiationMachine};
use crate::core::error::FailureReason;
use crate::core::negotiation::driver::{DriverEvent, DriverInput, DriverRole};
use crate::core::relay::SignalPayload;
use crate::core::transport::IceCandidate;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverState {
    CleaningUp,
    CreatingAnswer { queued: Vec<IceCandidate> },
    Finishing,
    Done,
    Failed(FailureReason),
}

#[derive(Debug)]
pub struct ReceiverNegotiation {
    state: ReceiverState,
}

impl Default for ReceiverNegotiation {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverNegotiation {
    pub fn new() -> Self {
        Self {
            state: ReceiverState::CleaningUp,
        }
    }

    pub fn state(&self) -> &ReceiverState {
        &self.state
    }
}

impl ReceiverState {
    fn label(&self) -> &'static str {
        match self {
            Self::CleaningUp => "cleaning-up",
            Self::CreatingAnswer { .. } => "creating-answer",
            Self::Finishing => "finishing",
            Self::Done => "done",
            Self::Failed(_) => "failed",
        }
    }
}

impl NegotiationMachine for ReceiverNegotiation {
    fn name(&self) -> &'static str {
        "receiver"
    }

    fn driver_role(&self) -> DriverRole {
        DriverRole::Receiver {
            initial_offer: None,
        }
    }

    fn handle(&mut self, event: NegotiationEvent) -> Vec<NegotiationAction> {
        use NegotiationEvent::{CleanupDone, Driver, Signal};

        let previous = self.state.label();
        let state = std::mem::replace(&mut self.state, ReceiverState::CleaningUp);
        let (next, actions) = match (state, event) {
            (state @ (ReceiverState::Done | ReceiverState::Failed(_)), _) => (state, Vec::new()),

            (_, Driver(DriverEvent::Failed(reason))) => (ReceiverState::Failed(reason), Vec::new()),

            (ReceiverState::CleaningUp, CleanupDone) => {
                (ReceiverState::CreatingAnswer { queued: Vec::new() }, Vec::new())
            }

            (state @ ReceiverState::CreatingAnswer { .. }, Signal(SignalPayload::Offer(offer))) => (
                state,
                vec![NegotiationAction::Deliver(DriverInput::DescriptionReceived(offer))],
            ),
            (ReceiverState::CreatingAnswer { mut queued }, Driver(DriverEvent::LocalCandidateReady(c))) => {
                queued.push(c);
                (ReceiverState::CreatingAnswer { queued }, Vec::new())
            }
            (ReceiverState::CreatingAnswer { queued }, Driver(DriverEvent::LocalDescriptionReady(answer))) => {
                let mut actions = vec![NegotiationAction::SendSignal(SignalPayload::Answer(answer))];
                if !queued.is_empty() {
                    actions.push(NegotiationAction::SendSignalBatch(
                        queued.into_iter().map(SignalPayload::IceCandidate).collect(),
                    ));
                }
                (ReceiverState::Finishing, actions)
            }

            (ReceiverState::Finishing, Driver(DriverEvent::LocalCandidateReady(c))) => (
                ReceiverState::Finishing,
                vec![NegotiationAction::SendSignal(SignalPayload::IceCandidate(c))],
            ),

            (
                state @ (ReceiverState::CreatingAnswer { .. } | ReceiverState::Finishing),
                Signal(SignalPayload::IceCandidate(c)),
            ) => (
                state,
                vec![NegotiationAction::Deliver(DriverInput::IceCandidateReceived(c))],
            ),

            (ReceiverState::CreatingAnswer { .. } | ReceiverState::Finishing, Driver(DriverEvent::Connected)) => {
                (ReceiverState::Done, Vec::new())
            }

            (state, event) => {
                debug!(machine = "receiver", state = ?state, event = ?event, "event ignored");
                (state, Vec::new())
            }
        };

        if next.label() != previous {
            debug!(machine = "receiver", from = previous, to = next.label(), "transition");
        }
        self.state = next;
        actions
    }

    fn outcome(&self) -> Option<Result<(), FailureReason>> {
        match &self.state {
            ReceiverState::Done => Some(Ok(())),
            ReceiverState::Failed(reason) => Some(Err(reason.clone())),
            _ => None,
        }
    }
}
