//! Peer transport seam.
//!
//! The negotiation and transfer machines talk to a [`PeerTransport`] and its
//! [`DataChannel`]s instead of a concrete WebRTC stack. `rtc` provides the
//! webrtc-rs implementation; tests run against the in-memory pair in `memory`.

#[cfg(test)]
pub mod memory;
pub mod rtc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

pub use rtc::RtcTransportFactory;

// ── Descriptions and candidates ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Offer or answer SDP, serialized as `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States that end a transfer in progress.
    pub fn is_interruption(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// Connection-level notifications, fanned out to every subscriber.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    GatheringStateChanged(GatheringState),
    ConnectionStateChanged(ConnectionState),
    IceConnectionFailed,
}

/// Per-channel notifications, buffered from the moment the channel exists.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Text(String),
    Binary(Bytes),
    BufferedAmountLow,
    Closed,
}

// ── Traits ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait DataChannel: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Hands out the channel's event stream. Only the first call gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    /// Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait PeerTransport: Send + Sync + fmt::Debug {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Creates an answer and applies it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    fn connection_state(&self) -> ConnectionState;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Channels opened by the remote side, buffered from construction.
    /// Only the first call gets the receiver.
    fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>;

    /// Idempotent.
    async fn close(&self);
}

/// Builds one fresh transport per negotiation attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host");
        let json = serde_json::to_value(&candidate).unwrap();

        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_some());
    }

    #[test]
    fn description_serializes_type_field() {
        let json = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "answer", "sdp": "v=0"}));
    }
}
