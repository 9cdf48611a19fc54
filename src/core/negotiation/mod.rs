//! Offer/answer/ICE negotiation between a caller and a receiver.
//!
//! The caller and receiver machines are pure: they take a
//! [`NegotiationEvent`] and return the [`NegotiationAction`]s to perform.
//! [`negotiate`] is the async runner that owns the driver and the signal
//! subscription and executes those actions until the machine is done.

pub mod caller;
pub mod driver;
pub mod receiver;

pub use caller::{CallerNegotiation, CallerState};
pub use driver::{DriverEvent, DriverInput, DriverRole, PeerConnectionDriver};
pub use receiver::{ReceiverNegotiation, ReceiverState};

use crate::core::error::FailureReason;
use crate::core::relay::{SignalPayload, SignalSubscription, SignalingRelay, UserId};
use crate::core::transport::{PeerTransport, TransportFactory};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    /// Stale signaling rows from the peer have been deleted.
    CleanupDone,
    Driver(DriverEvent),
    /// A decoded signal from the remote peer.
    Signal(SignalPayload),
}

/// Side effects requested by a negotiation machine.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationAction {
    SendSignal(SignalPayload),
    /// Several signals written in one relay insert, in order.
    SendSignalBatch(Vec<SignalPayload>),
    Deliver(DriverInput),
}

pub trait NegotiationMachine: Send {
    fn name(&self) -> &'static str;

    fn driver_role(&self) -> DriverRole;

    fn handle(&mut self, event: NegotiationEvent) -> Vec<NegotiationAction>;

    /// `Some` once the machine reached `done` or `failed`.
    fn outcome(&self) -> Option<Result<(), FailureReason>>;
}

/// What a peer needs to negotiate: who it is, how to reach the relay, and
/// how to build transports.
#[derive(Clone)]
pub struct NegotiationContext {
    pub self_id: UserId,
    pub relay: SignalingRelay,
    pub transports: Arc<dyn TransportFactory>,
    pub connect_timeout: Duration,
}

/// Runs `machine` to completion over `transport`.
///
/// Pass a `subscription` opened earlier when signals from `remote` might be
/// sent before this call starts; otherwise one is opened here. Stale rows
/// from `remote` are always cleaned up before anything is exchanged. The
/// transport is left open; the caller owns it.
pub async fn negotiate<M: NegotiationMachine>(
    mut machine: M,
    ctx: &NegotiationContext,
    remote: &UserId,
    transport: Arc<dyn PeerTransport>,
    subscription: Option<SignalSubscription>,
) -> Result<(), FailureReason> {
    let mut signals = match subscription {
        Some(subscription) => subscription,
        None => ctx.relay.subscribe(&ctx.self_id, Some(remote)).await?,
    };
    let result = run(&mut machine, ctx, remote, transport, &mut signals).await;
    signals.close();

    match &result {
        Ok(()) => info!(event = "negotiation_done", role = machine.name(), %remote),
        Err(reason) => warn!(event = "negotiation_failed", role = machine.name(), %remote, %reason),
    }
    result
}

async fn run<M: NegotiationMachine>(
    machine: &mut M,
    ctx: &NegotiationContext,
    remote: &UserId,
    transport: Arc<dyn PeerTransport>,
    signals: &mut SignalSubscription,
) -> Result<(), FailureReason> {
    ctx.relay.cleanup(&ctx.self_id, remote).await?;
    let actions = machine.handle(NegotiationEvent::CleanupDone);

    let mut driver = PeerConnectionDriver::spawn(transport, machine.driver_role(), ctx.connect_timeout);
    execute(actions, ctx, remote, &driver).await?;

    loop {
        if let Some(outcome) = machine.outcome() {
            return outcome;
        }
        let event = tokio::select! {
            event = driver.next_event() => NegotiationEvent::Driver(event.unwrap_or_else(|| {
                DriverEvent::Failed(FailureReason::connection("driver stopped unexpectedly"))
            })),
            message = signals.next() => match message {
                Some(message) => NegotiationEvent::Signal(message.payload),
                None => return Err(FailureReason::Relay("signal subscription closed".into())),
            },
        };
        let actions = machine.handle(event);
        execute(actions, ctx, remote, &driver).await?;
    }
}

async fn execute(
    actions: Vec<NegotiationAction>,
    ctx: &NegotiationContext,
    remote: &UserId,
    driver: &PeerConnectionDriver,
) -> Result<(), FailureReason> {
    for action in actions {
        match action {
            NegotiationAction::SendSignal(payload) => {
                debug!(event = "signal_out", kind = payload.kind(), %remote);
                ctx.relay.send(&ctx.self_id, remote, payload).await?;
            }
            NegotiationAction::SendSignalBatch(payloads) => {
                ctx.relay.send_batch(&ctx.self_id, remote, payloads).await?;
            }
            NegotiationAction::Deliver(input) => driver.deliver(input),
        }
    }
    Ok(())
}
