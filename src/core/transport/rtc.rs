//! webrtc-rs implementation of the transport seam.
//!
//! Callbacks registered on the peer connection and its channels forward into
//! tokio channels, so the machines above never see webrtc-rs types.

use super::{
    ChannelEvent, ConnectionState, DataChannel, GatheringState, IceCandidate, PeerTransport,
    SdpKind, SessionDescription, TransportEvent, TransportFactory,
};
use crate::core::config::{Settings, TRANSPORT_EVENT_CAPACITY};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

// ── Factory ──────────────────────────────────────────────────────────────────

/// Creates webrtc-rs peer connections with the configured ICE servers.
pub struct RtcTransportFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcTransportFactory {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_include_loopback_candidate(settings.include_loopback_candidates);

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = settings
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
            })
            .collect();

        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self) -> Result<Arc<dyn PeerTransport>> {
        let pc = self
            .api
            .new_peer_connection(self.config.clone())
            .await
            .context("failed to create peer connection")?;
        Ok(RtcTransport::attach(Arc::new(pc)))
    }
}

// ── Peer connection ──────────────────────────────────────────────────────────

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: broadcast::Sender<TransportEvent>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>>,
    closed: AtomicBool,
}

impl fmt::Debug for RtcTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcTransport")
            .field("state", &self.pc.connection_state())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RtcTransport {
    fn attach(pc: Arc<RTCPeerConnection>) -> Arc<Self> {
        let (events, _) = broadcast::channel(TRANSPORT_EVENT_CAPACITY);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => warn!(event = "ice_candidate_encode_failed", %e, "Dropping local candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let tx = tx.clone();
            Box::pin(async move {
                let state = match state {
                    RTCIceGathererState::Gathering => GatheringState::Gathering,
                    RTCIceGathererState::Complete => GatheringState::Complete,
                    _ => GatheringState::New,
                };
                debug!(event = "ice_gathering_state", ?state);
                let _ = tx.send(TransportEvent::GatheringStateChanged(state));
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let state = map_connection_state(state);
                match state {
                    ConnectionState::Connected => {
                        info!(event = "webrtc_connected", "WebRTC connection established")
                    }
                    ConnectionState::Failed => {
                        error!(event = "webrtc_failed", "WebRTC connection failed")
                    }
                    ConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", "WebRTC connection disconnected")
                    }
                    ConnectionState::Closed => {
                        info!(event = "webrtc_closed", "WebRTC connection closed")
                    }
                    _ => {}
                }
                let _ = tx.send(TransportEvent::ConnectionStateChanged(state));
            })
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                if state == RTCIceConnectionState::Failed {
                    error!(event = "ice_failed", "ICE connection failed");
                    let _ = tx.send(TransportEvent::IceConnectionFailed);
                }
            })
        }));

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let incoming_tx = incoming_tx.clone();
            Box::pin(async move {
                debug!(event = "remote_channel", label = %dc.label());
                let channel = RtcDataChannel::attach(dc).await;
                let _ = incoming_tx.send(channel as Arc<dyn DataChannel>);
            })
        }));

        Arc::new(Self {
            pc,
            events,
            incoming: Mutex::new(Some(incoming_rx)),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .with_context(|| format!("failed to create data channel '{label}'"))?;
        Ok(RtcDataChannel::attach(dc).await)
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>> {
        self.incoming.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!(event = "webrtc_close_failed", %e, "Error closing peer connection");
        }
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

// ── Data channel ─────────────────────────────────────────────────────────────

pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl fmt::Debug for RtcDataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcDataChannel")
            .field("label", &self.label)
            .field("state", &self.dc.ready_state())
            .finish()
    }
}

impl RtcDataChannel {
    async fn attach(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let label = dc.label().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let close_tx = tx.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            debug!(event = "dc_closed", channel = %close_label, "DataChannel closed");
            let _ = close_tx.send(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        let error_label = label.clone();
        dc.on_error(Box::new(move |err| {
            let error_label = error_label.clone();
            Box::pin(async move {
                error!(event = "dc_error", channel = %error_label, %err, "DataChannel transport error");
            })
        }));

        let message_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let event = if msg.is_string {
                ChannelEvent::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelEvent::Binary(msg.data)
            };
            let _ = message_tx.send(event);
            Box::pin(async {})
        }));

        let low_tx = tx.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let _ = low_tx.send(ChannelEvent::BufferedAmountLow);
            Box::pin(async {})
        }))
        .await;

        // Remote channels may already be open by the time handlers are attached.
        if dc.ready_state() == RTCDataChannelState::Open {
            let _ = tx.send(ChannelEvent::Open);
        }

        Arc::new(Self {
            dc,
            label,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc
            .send_text(text)
            .await
            .map_err(|e| anyhow!("send on '{}' failed: {e}", self.label))?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc
            .send(&data)
            .await
            .map_err(|e| anyhow!("send on '{}' failed: {e}", self.label))?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn close(&self) {
        if matches!(
            self.dc.ready_state(),
            RTCDataChannelState::Closing | RTCDataChannelState::Closed
        ) {
            return;
        }
        if let Err(e) = self.dc.close().await {
            debug!(event = "dc_close_failed", channel = %self.label, %e);
        }
    }
}
