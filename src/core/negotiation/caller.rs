//! Caller side of one offer/answer/ICE exchange.

use super::{NegotiationAction, NegotiationEvent, NegotiationMachine};
use crate::core::error::FailureReason;
use crate::core::negotiation::driver::{DriverEvent, DriverInput, DriverRole};
use crate::core::relay::SignalPayload;
use crate::core::transport::IceCandidate;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum CallerState {
    CleaningUp,
    CreatingOffer { queued: Vec<IceCandidate> },
    WaitingForAnswer { queued: Vec<IceCandidate> },
    SettingRemoteAnswer,
    Done,
    Failed(FailureReason),
}

#[derive(Debug)]
pub struct CallerNegotiation {
    state: CallerState,
}

impl Default for CallerNegotiation {
    fn default() -> Self {
        Self::new()
    }
}

impl CallerNegotiation {
    pub fn new() -> Self {
        Self {
            state: CallerState::CleaningUp,
        }
    }

    pub fn state(&self) -> &CallerState {
        &self.state
    }
}

impl CallerState {
    fn label(&self) -> &'static str {
        match self {
            Self::CleaningUp => "cleaning-up",
            Self::CreatingOffer { .. } => "creating-offer",
            Self::WaitingForAnswer { .. } => "waiting-for-answer",
            Self::SettingRemoteAnswer => "setting-remote-answer",
            Self::Done => "done",
            Self::Failed(_) => "failed",
        }
    }
}

impl NegotiationMachine for CallerNegotiation {
    fn name(&self) -> &'static str {
        "caller"
    }

    fn driver_role(&self) -> DriverRole {
        DriverRole::Caller
    }

    fn handle(&mut self, event: NegotiationEvent) -> Vec<NegotiationAction> {
        use NegotiationEvent::{CleanupDone, Driver, Signal};

        let previous = self.state.label();
        let state = std::mem::replace(&mut self.state, CallerState::CleaningUp);
        let (next, actions) = match (state, event) {
            (state @ (CallerState::Done | CallerState::Failed(_)), _) => (state, Vec::new()),

            // Failure escapes every non-terminal state.
            (_, Driver(DriverEvent::Failed(reason))) => (CallerState::Failed(reason), Vec::new()),

            (CallerState::CleaningUp, CleanupDone) => {
                (CallerState::CreatingOffer { queued: Vec::new() }, Vec::new())
            }

            (CallerState::CreatingOffer { queued }, Driver(DriverEvent::LocalDescriptionReady(offer))) => (
                CallerState::WaitingForAnswer { queued },
                vec![NegotiationAction::SendSignal(SignalPayload::Offer(offer))],
            ),
            (CallerState::CreatingOffer { mut queued }, Driver(DriverEvent::LocalCandidateReady(c))) => {
                queued.push(c);
                (CallerState::CreatingOffer { queued }, Vec::new())
            }
            (CallerState::CreatingOffer { queued }, Signal(SignalPayload::Answer(_))) => {
                warn!(event = "stale_answer", "Answer arrived before our offer was sent; dropping");
                (CallerState::CreatingOffer { queued }, Vec::new())
            }

            (CallerState::WaitingForAnswer { mut queued }, Driver(DriverEvent::LocalCandidateReady(c))) => {
                queued.push(c);
                (CallerState::WaitingForAnswer { queued }, Vec::new())
            }
            (CallerState::WaitingForAnswer { queued }, Signal(SignalPayload::Answer(answer))) => {
                let mut actions = vec![NegotiationAction::Deliver(DriverInput::DescriptionReceived(answer))];
                if !queued.is_empty() {
                    actions.push(NegotiationAction::SendSignalBatch(
                        queued.into_iter().map(SignalPayload::IceCandidate).collect(),
                    ));
                }
                (CallerState::SettingRemoteAnswer, actions)
            }

            (CallerState::SettingRemoteAnswer, Driver(DriverEvent::LocalCandidateReady(c))) => (
                CallerState::SettingRemoteAnswer,
                vec![NegotiationAction::SendSignal(SignalPayload::IceCandidate(c))],
            ),
            (CallerState::SettingRemoteAnswer, Driver(DriverEvent::Connected)) => {
                (CallerState::Done, Vec::new())
            }

            // Remote candidates go to the driver, which holds them until
            // the answer is applied.
            (
                state @ (CallerState::CreatingOffer { .. }
                | CallerState::WaitingForAnswer { .. }
                | CallerState::SettingRemoteAnswer),
                Signal(SignalPayload::IceCandidate(c)),
            ) => (
                state,
                vec![NegotiationAction::Deliver(DriverInput::IceCandidateReceived(c))],
            ),

            (state, event) => {
                debug!(machine = "caller", state = ?state, event = ?event, "event ignored");
                (state, Vec::new())
            }
        };

        if next.label() != previous {
            debug!(machine = "caller", from = previous, to = next.label(), "transition");
        }
        self.state = next;
        actions
    }

    fn outcome(&self) -> Option<Result<(), FailureReason>> {
        match &self.state {
            CallerState::Done => Some(Ok(())),
            CallerState::Failed(reason) => Some(Err(reason.clone())),
            _ => None,
        }
    }
}
