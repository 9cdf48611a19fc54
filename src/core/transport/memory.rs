//! In-memory transport pair used by the tests.
//!
//! Endpoints find each other through the `memory:<id>` SDP they exchange.
//! An endpoint reports connected once it holds a local and a remote
//! description and has applied at least one remote candidate.

use super::{
    ChannelEvent, ConnectionState, DataChannel, GatheringState, IceCandidate, PeerTransport,
    SessionDescription, TransportEvent, TransportFactory,
};
use crate::core::config::TRANSPORT_EVENT_CAPACITY;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc};

#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: Mutex<HashMap<u64, Weak<MemoryTransport>>>,
    next_id: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn find(&self, id: u64) -> Option<Arc<MemoryTransport>> {
        self.endpoints.lock().unwrap().get(&id)?.upgrade()
    }
}

pub struct MemoryTransportFactory {
    network: Arc<MemoryNetwork>,
    auto_connect: bool,
    created: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryTransportFactory {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self {
            network,
            auto_connect: true,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Endpoints from this factory never reach "connected" on their own.
    pub fn stalled(network: Arc<MemoryNetwork>) -> Self {
        Self {
            auto_connect: false,
            ..Self::new(network)
        }
    }

    pub fn created(&self) -> Vec<Arc<MemoryTransport>> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(&self) -> Result<Arc<dyn PeerTransport>> {
        let transport = MemoryTransport::new(self.network.clone(), self.auto_connect);
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

// ── Endpoint ─────────────────────────────────────────────────────────────────

struct EndpointState {
    peer: Option<Weak<MemoryTransport>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    connection: ConnectionState,
    channels: Vec<Weak<MemoryChannel>>,
}

pub struct MemoryTransport {
    id: u64,
    network: Arc<MemoryNetwork>,
    auto_connect: bool,
    state: Mutex<EndpointState>,
    events: broadcast::Sender<TransportEvent>,
    incoming_tx: mpsc::UnboundedSender<Arc<dyn DataChannel>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>>>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport").field("id", &self.id).finish()
    }
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>, auto_connect: bool) -> Arc<Self> {
        let id = network.next_id.fetch_add(1, Ordering::Relaxed);
        let (events, _) = broadcast::channel(TRANSPORT_EVENT_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            id,
            network: network.clone(),
            auto_connect,
            state: Mutex::new(EndpointState {
                peer: None,
                local: None,
                remote: None,
                applied: Vec::new(),
                connection: ConnectionState::New,
                channels: Vec::new(),
            }),
            events,
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        });
        network
            .endpoints
            .lock()
            .unwrap()
            .insert(id, Arc::downgrade(&transport));
        transport
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn gather(&self) {
        self.emit(TransportEvent::GatheringStateChanged(GatheringState::Gathering));
        for component in 1..=2 {
            self.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{} {component} udp 2122260223 127.0.0.1 {} typ host",
                self.id,
                40_000 + self.id
            ))));
        }
        self.emit(TransportEvent::GatheringStateChanged(GatheringState::Complete));
    }

    fn set_connection(&self, next: ConnectionState) {
        {
            let mut state = self.lock();
            if state.connection == next || state.connection == ConnectionState::Closed {
                return;
            }
            state.connection = next;
        }
        self.emit(TransportEvent::ConnectionStateChanged(next));
    }

    fn maybe_connect(&self) {
        let ready = {
            let state = self.lock();
            self.auto_connect
                && state.local.is_some()
                && state.remote.is_some()
                && !state.applied.is_empty()
                && matches!(
                    state.connection,
                    ConnectionState::New | ConnectionState::Connecting
                )
        };
        if ready {
            self.set_connection(ConnectionState::Connected);
        }
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.lock().applied.clone()
    }

    pub fn has_remote_description(&self) -> bool {
        self.lock().remote.is_some()
    }

    pub fn peer(&self) -> Option<Arc<MemoryTransport>> {
        self.lock().peer.as_ref()?.upgrade()
    }

    pub fn inject_state(&self, state: ConnectionState) {
        self.set_connection(state);
    }

    pub fn inject_ice_failure(&self) {
        self.emit(TransportEvent::IceConnectionFailed);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().connection == ConnectionState::Closed
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = SessionDescription::offer(format!("memory:{}", self.id));
        self.lock().local = Some(offer.clone());
        self.gather();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = SessionDescription::answer(format!("memory:{}", self.id));
        {
            let mut state = self.lock();
            if state.remote.is_none() {
                return Err(anyhow!("cannot answer without a remote offer"));
            }
            state.local = Some(answer.clone());
        }
        self.gather();
        self.maybe_connect();
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let peer = description
            .sdp
            .strip_prefix("memory:")
            .and_then(|id| id.parse().ok())
            .and_then(|id| self.network.find(id));
        {
            let mut state = self.lock();
            state.remote = Some(description);
            if let Some(peer) = peer {
                state.peer = Some(Arc::downgrade(&peer));
            }
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        {
            let mut state = self.lock();
            if state.remote.is_none() {
                return Err(anyhow!("remote description not set"));
            }
            state.applied.push(candidate);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        if self.is_closed() {
            return Err(anyhow!("transport closed"));
        }
        let peer = self.peer();
        let (local, remote) = MemoryChannel::pair(label, peer.is_some());
        self.lock().channels.push(Arc::downgrade(&local));
        if let Some(peer) = peer {
            peer.lock().channels.push(Arc::downgrade(&remote));
            let _ = peer.incoming_tx.send(remote);
        }
        Ok(local)
    }

    fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn take_incoming_channels(&self) -> Option<mpsc::UnboundedReceiver<Arc<dyn DataChannel>>> {
        self.incoming_rx.lock().unwrap().take()
    }

    async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let channels: Vec<_> = self.lock().channels.drain(..).collect();
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.close_now();
        }
        self.set_connection(ConnectionState::Closed);
        if let Some(peer) = self.peer() {
            peer.set_connection(ConnectionState::Disconnected);
        }
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

pub struct MemoryChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    threshold: AtomicUsize,
    peer: Mutex<Weak<MemoryChannel>>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MemoryChannel {
    fn new(label: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            threshold: AtomicUsize::new(0),
            peer: Mutex::new(Weak::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Two linked ends of one channel. Unlinked ends never open.
    pub fn pair(label: &str, linked: bool) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(label);
        let b = Self::new(label);
        if linked {
            *a.peer.lock().unwrap() = Arc::downgrade(&b);
            *b.peer.lock().unwrap() = Arc::downgrade(&a);
            for end in [&a, &b] {
                end.open.store(true, Ordering::Release);
                end.push(ChannelEvent::Open);
            }
        }
        (a, b)
    }

    fn push(&self, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }

    fn remote(&self) -> Option<Arc<MemoryChannel>> {
        self.peer.lock().unwrap().upgrade()
    }

    fn close_now(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.open.store(false, Ordering::Release);
        self.push(ChannelEvent::Closed);
        if let Some(remote) = self.remote() {
            remote.close_now();
        }
    }

    pub fn low_threshold(&self) -> usize {
        self.threshold.load(Ordering::Acquire)
    }

    fn deliver(&self, event: ChannelEvent) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("channel '{}' is not open", self.label));
        }
        let remote = self
            .remote()
            .ok_or_else(|| anyhow!("channel '{}' has no remote end", self.label))?;
        remote.push(event);
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.deliver(ChannelEvent::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.deliver(ChannelEvent::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Release);
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.rx.lock().unwrap().take()
    }

    async fn close(&self) {
        self.close_now();
    }
}
