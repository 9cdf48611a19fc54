//! Peer connection driver.
//!
//! Owns one transport's negotiation lifecycle in a dedicated task: local
//! description creation, remote candidate buffering, and failure/timeout
//! detection. The owning machine feeds it remote signals and reads back
//! [`DriverEvent`]s; dropping the handle stops the task.

use crate::core::config::PROBE_CHANNEL_LABEL;
use crate::core::error::FailureReason;
use crate::core::transport::{
    ConnectionState, DataChannel, GatheringState, IceCandidate, PeerTransport, SdpKind,
    SessionDescription, TransportEvent,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum DriverRole {
    Caller,
    Receiver {
        initial_offer: Option<SessionDescription>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverInput {
    DescriptionReceived(SessionDescription),
    IceCandidateReceived(IceCandidate),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    LocalDescriptionReady(SessionDescription),
    LocalCandidateReady(IceCandidate),
    Connected,
    Failed(FailureReason),
}

/// Remote candidates that arrived before the remote description.
#[derive(Debug, Default)]
pub struct PendingIceCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingIceCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Empties the queue in arrival order.
    pub fn drain(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

pub struct PeerConnectionDriver {
    inputs: mpsc::UnboundedSender<DriverInput>,
    events: mpsc::UnboundedReceiver<DriverEvent>,
    task: JoinHandle<()>,
}

impl PeerConnectionDriver {
    pub fn spawn(
        transport: Arc<dyn PeerTransport>,
        role: DriverRole,
        connect_timeout: Duration,
    ) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // Subscribe before the task starts so no gathering event is missed.
        let transport_events = transport.subscribe();

        let task = DriverTask {
            caller: role == DriverRole::Caller,
            transport,
            connect_timeout,
            remote_set: false,
            pending: PendingIceCandidates::default(),
            probe: None,
            deadline: None,
            events: events_tx,
        };
        let handle = tokio::spawn(task.run(role, inputs_rx, transport_events));

        Self {
            inputs: inputs_tx,
            events: events_rx,
            task: handle,
        }
    }

    pub fn deliver(&self, input: DriverInput) {
        if self.inputs.send(input).is_err() {
            debug!(event = "driver_input_dropped", "Driver already stopped");
        }
    }

    /// `None` once the driver task has stopped and all events were read.
    pub async fn next_event(&mut self) -> Option<DriverEvent> {
        self.events.recv().await
    }
}

impl Drop for PeerConnectionDriver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct DriverTask {
    caller: bool,
    transport: Arc<dyn PeerTransport>,
    connect_timeout: Duration,
    remote_set: bool,
    pending: PendingIceCandidates,
    probe: Option<Arc<dyn DataChannel>>,
    deadline: Option<Instant>,
    events: mpsc::UnboundedSender<DriverEvent>,
}

/// Whether the driver loop keeps running.
enum Flow {
    Continue,
    Stop,
}

impl DriverTask {
    async fn run(
        mut self,
        role: DriverRole,
        mut inputs: mpsc::UnboundedReceiver<DriverInput>,
        mut transport_events: broadcast::Receiver<TransportEvent>,
    ) {
        let started = match role {
            DriverRole::Caller => self.start_caller().await,
            DriverRole::Receiver {
                initial_offer: Some(offer),
            } => self.apply_remote(offer).await,
            DriverRole::Receiver {
                initial_offer: None,
            } => Ok(()),
        };
        if let Err(reason) = started {
            self.emit(DriverEvent::Failed(reason));
            return;
        }

        loop {
            let deadline = self.deadline;
            let flow = tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input).await,
                    None => Flow::Stop,
                },
                event = transport_events.recv() => match event {
                    Ok(event) => self.handle_transport(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "driver_lagged", skipped, "Driver missed transport events");
                        Flow::Continue
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.fail(FailureReason::connection("transport event stream ended"))
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(
                        event = "negotiation_timeout",
                        timeout_secs = self.connect_timeout.as_secs_f32(),
                        "ICE gathering completed but the connection never came up"
                    );
                    self.fail(FailureReason::NegotiationTimeout)
                }
            };
            if let Flow::Stop = flow {
                return;
            }
        }
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, reason: FailureReason) -> Flow {
        self.emit(DriverEvent::Failed(reason));
        Flow::Stop
    }

    async fn start_caller(&mut self) -> Result<(), FailureReason> {
        // The throwaway channel puts an SCTP section into the offer, which
        // is what makes the transport start gathering.
        let probe = self
            .transport
            .create_data_channel(PROBE_CHANNEL_LABEL)
            .await
            .map_err(FailureReason::connection)?;
        self.probe = Some(probe);

        let offer = self
            .transport
            .create_offer()
            .await
            .map_err(FailureReason::connection)?;
        debug!(event = "local_offer_ready");
        self.emit(DriverEvent::LocalDescriptionReady(offer));
        Ok(())
    }

    async fn handle_input(&mut self, input: DriverInput) -> Flow {
        match input {
            DriverInput::DescriptionReceived(description) => {
                match self.apply_remote(description).await {
                    Ok(()) => Flow::Continue,
                    Err(reason) => self.fail(reason),
                }
            }
            DriverInput::IceCandidateReceived(candidate) => {
                if self.remote_set {
                    self.add_candidate(candidate).await;
                } else {
                    self.pending.push(candidate);
                    debug!(event = "candidate_queued", pending = self.pending.len());
                }
                Flow::Continue
            }
        }
    }

    async fn apply_remote(&mut self, description: SessionDescription) -> Result<(), FailureReason> {
        if self.remote_set {
            warn!(event = "duplicate_remote_description", kind = description.kind.as_str(), "Ignoring");
            return Ok(());
        }
        let expected = if self.caller {
            SdpKind::Answer
        } else {
            SdpKind::Offer
        };
        if description.kind != expected {
            warn!(
                event = "unexpected_remote_description",
                kind = description.kind.as_str(),
                expected = expected.as_str(),
                "Ignoring"
            );
            return Ok(());
        }

        self.transport
            .set_remote_description(description)
            .await
            .map_err(FailureReason::connection)?;
        self.remote_set = true;

        let queued: Vec<_> = self.pending.drain().collect();
        if !queued.is_empty() {
            debug!(event = "candidates_flushed", count = queued.len());
        }
        for candidate in queued {
            self.add_candidate(candidate).await;
        }

        if expected == SdpKind::Offer {
            let answer = self
                .transport
                .create_answer()
                .await
                .map_err(FailureReason::connection)?;
            debug!(event = "local_answer_ready");
            self.emit(DriverEvent::LocalDescriptionReady(answer));
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!(event = "candidate_rejected", %e, "Transport rejected remote candidate");
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.emit(DriverEvent::LocalCandidateReady(candidate));
                Flow::Continue
            }
            TransportEvent::GatheringStateChanged(GatheringState::Complete) => {
                self.deadline = Some(Instant::now() + self.connect_timeout);
                debug!(event = "ice_gathering_complete");
                Flow::Continue
            }
            TransportEvent::GatheringStateChanged(_) => {
                self.deadline = None;
                Flow::Continue
            }
            TransportEvent::ConnectionStateChanged(ConnectionState::Connected) => {
                if let Some(probe) = self.probe.take() {
                    probe.close().await;
                }
                info!(event = "peer_connected", "Peer connection established");
                self.emit(DriverEvent::Connected);
                Flow::Stop
            }
            TransportEvent::ConnectionStateChanged(ConnectionState::Failed) => {
                self.fail(FailureReason::connection("transport reported failed"))
            }
            TransportEvent::IceConnectionFailed => {
                self.fail(FailureReason::connection("ICE connection failed"))
            }
            TransportEvent::ConnectionStateChanged(_) => Flow::Continue,
        }
    }
}
