//! In-Memory Transport
//!
//! Loopback implementation of the transport seam. Two transports created from
//! the same [`MemoryNetwork`] connect to each other once the offer/answer
//! exchange completes, exactly as two WebRTC peers would, but without any
//! sockets. Used by tests and for offline runs on a single machine.
//!
//! The session description produced here is a minimal SDP whose origin line
//! carries the peer id; applying the remote answer is what links the pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::signaling::{SignalingBlob, SignalingKind};
use super::relay::IceServerConfig;
use super::transport::{
    DataChannel, PeerConnectionState, PeerTransport, TransportError, TransportEvent,
    TransportEventSender, TransportFactory, TransportParts,
};

/// How candidate gathering behaves for transports from a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringMode {
    /// Completes immediately.
    Immediate,
    /// Completes after a delay.
    Delayed(Duration),
    /// Never completes; callers must time out.
    Stalled,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// NETWORK
// =============================================================================

/// Shared registry that lets memory transports find each other.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    peers: Mutex<HashMap<String, Arc<MemoryPeer>>>,
    gathering: Mutex<GatheringMode>,
    stall_descriptions: AtomicBool,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Empty network with immediate gathering.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                peers: Mutex::new(HashMap::new()),
                gathering: Mutex::new(GatheringMode::Immediate),
                stall_descriptions: AtomicBool::new(false),
            }),
        }
    }

    /// Change gathering behavior for transports created afterwards.
    pub fn set_gathering(&self, mode: GatheringMode) {
        *lock(&self.inner.gathering) = mode;
    }

    /// Make offer, answer and remote-description calls on transports created
    /// afterwards hang forever, like a wedged peer connection.
    pub fn stall_descriptions(&self, stalled: bool) {
        self.inner.stall_descriptions.store(stalled, Ordering::SeqCst);
    }

    /// Factory bound to this network.
    pub fn factory(&self) -> MemoryTransportFactory {
        MemoryTransportFactory { network: self.clone() }
    }

    /// Number of transports ever created on this network.
    pub fn transport_count(&self) -> usize {
        lock(&self.inner.peers).len()
    }

    /// Drop every live link, as if the network path vanished. Both sides see
    /// their channel close and their connection go to `Disconnected`.
    pub fn sever_links(&self) {
        for peer in self.peers() {
            peer.sever(PeerConnectionState::Disconnected);
        }
    }

    /// Report connection failure to every transport that has not closed.
    pub fn fail_all(&self) {
        for peer in self.peers() {
            if !peer.closed.load(Ordering::SeqCst) {
                peer.emit(TransportEvent::StateChanged(PeerConnectionState::Failed));
            }
        }
    }

    fn peers(&self) -> Vec<Arc<MemoryPeer>> {
        lock(&self.inner.peers).values().cloned().collect()
    }

    fn register(&self, peer: Arc<MemoryPeer>) {
        lock(&self.inner.peers).insert(peer.id.clone(), peer);
    }

    fn find(&self, id: &str) -> Option<Arc<MemoryPeer>> {
        lock(&self.inner.peers).get(id).cloned()
    }
}

/// Creates [`MemoryTransport`]s on a [`MemoryNetwork`].
pub struct MemoryTransportFactory {
    network: MemoryNetwork,
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(&self, _ice_servers: &[IceServerConfig]) -> Result<TransportParts, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MemoryPeer {
            id: Uuid::new_v4().simple().to_string(),
            events: tx,
            gathering: *lock(&self.network.inner.gathering),
            stalled: self.network.inner.stall_descriptions.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
            state: Mutex::new(PeerState::default()),
        });
        self.network.register(peer.clone());
        debug!("Memory transport {} created", &peer.id[..8]);

        Ok(TransportParts {
            transport: Arc::new(MemoryTransport { peer, network: self.network.clone() }),
            events: rx,
        })
    }
}

// =============================================================================
// PEER
// =============================================================================

struct MemoryPeer {
    id: String,
    events: TransportEventSender,
    gathering: GatheringMode,
    stalled: bool,
    closed: AtomicBool,
    state: Mutex<PeerState>,
}

#[derive(Default)]
struct PeerState {
    local: Option<SignalingKind>,
    remote_id: Option<String>,
    channel: Option<Arc<MemoryChannel>>,
    connected: bool,
}

impl MemoryPeer {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn maybe_stall(&self) {
        if self.stalled {
            std::future::pending::<()>().await;
        }
    }

    fn sdp(&self, kind: SignalingKind) -> String {
        format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=memory-{}\r\nt=0 0\r\n",
            self.id, kind
        )
    }

    fn sever(&self, state: PeerConnectionState) {
        let channel = {
            let mut guard = lock(&self.state);
            if !guard.connected {
                return;
            }
            guard.connected = false;
            guard.channel.clone()
        };
        if let Some(channel) = channel {
            channel.shut();
        }
        self.emit(TransportEvent::StateChanged(state));
    }
}

/// Peer id from the origin line of a memory SDP.
fn origin_id(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=- "))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
}

/// Loopback peer connection.
pub struct MemoryTransport {
    peer: Arc<MemoryPeer>,
    network: MemoryNetwork,
}

impl MemoryTransport {
    /// Link the offerer (`self`) with the answerer and bring both up.
    fn link(&self, answerer: &Arc<MemoryPeer>) -> Result<(), TransportError> {
        let offer_channel = lock(&self.peer.state)
            .channel
            .clone()
            .ok_or_else(|| TransportError::Setup("offer carries no data channel".into()))?;

        let link = Arc::new(ChannelLink {
            open: AtomicBool::new(true),
            sides: [self.peer.events.clone(), answerer.events.clone()],
        });
        offer_channel.attach(link.clone(), 0);
        let answer_channel = Arc::new(MemoryChannel::new(offer_channel.label()));
        answer_channel.attach(link, 1);

        {
            let mut mine = lock(&self.peer.state);
            mine.connected = true;
        }
        {
            let mut theirs = lock(&answerer.state);
            theirs.connected = true;
            theirs.channel = Some(answer_channel.clone());
        }

        for peer in [&self.peer, answerer] {
            peer.emit(TransportEvent::StateChanged(PeerConnectionState::Connecting));
            peer.emit(TransportEvent::StateChanged(PeerConnectionState::Connected));
        }
        answerer.emit(TransportEvent::ChannelAnnounced(answer_channel));
        self.peer.emit(TransportEvent::ChannelOpen);
        answerer.emit(TransportEvent::ChannelOpen);
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        if self.peer.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let channel = Arc::new(MemoryChannel::new(label.to_string()));
        lock(&self.peer.state).channel = Some(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<(), TransportError> {
        self.peer.maybe_stall().await;
        let mut state = lock(&self.peer.state);
        if state.local.is_some() {
            return Err(TransportError::Setup("local description already set".into()));
        }
        state.local = Some(SignalingKind::Offer);
        Ok(())
    }

    async fn create_answer(&self) -> Result<(), TransportError> {
        self.peer.maybe_stall().await;
        let mut state = lock(&self.peer.state);
        if state.remote_id.is_none() {
            return Err(TransportError::Setup("no remote offer".into()));
        }
        state.local = Some(SignalingKind::Answer);
        Ok(())
    }

    async fn apply_remote(&self, blob: &SignalingBlob) -> Result<(), TransportError> {
        self.peer.maybe_stall().await;
        if self.peer.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let remote_id = origin_id(blob.sdp())
            .ok_or_else(|| TransportError::Setup("description has no origin".into()))?;
        lock(&self.peer.state).remote_id = Some(remote_id.clone());

        if blob.kind() == SignalingKind::Answer {
            let answerer = self
                .network
                .find(&remote_id)
                .ok_or_else(|| TransportError::Setup(format!("unknown peer {remote_id}")))?;
            if lock(&answerer.state).remote_id.as_deref() != Some(self.peer.id.as_str()) {
                return Err(TransportError::Setup("answer was made for another offer".into()));
            }
            self.link(&answerer)?;
        }
        Ok(())
    }

    async fn wait_gathering_complete(&self) {
        match self.peer.gathering {
            GatheringMode::Immediate => {}
            GatheringMode::Delayed(delay) => tokio::time::sleep(delay).await,
            GatheringMode::Stalled => std::future::pending::<()>().await,
        }
    }

    async fn local_description(&self) -> Option<SignalingBlob> {
        let kind = lock(&self.peer.state).local?;
        Some(SignalingBlob::new(kind, self.peer.sdp(kind)))
    }

    async fn close(&self) {
        if self.peer.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let remote = lock(&self.peer.state).remote_id.clone();
        self.peer.sever(PeerConnectionState::Closed);
        if let Some(remote) = remote.and_then(|id| self.network.find(&id)) {
            remote.sever(PeerConnectionState::Disconnected);
        }
        let channel = lock(&self.peer.state).channel.clone();
        if let Some(channel) = channel {
            channel.shut();
        }
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

struct ChannelLink {
    open: AtomicBool,
    sides: [TransportEventSender; 2],
}

/// One end of a loopback data channel.
pub struct MemoryChannel {
    label: String,
    end: Mutex<Option<(Arc<ChannelLink>, usize)>>,
}

impl MemoryChannel {
    fn new(label: String) -> Self {
        Self { label, end: Mutex::new(None) }
    }

    fn attach(&self, link: Arc<ChannelLink>, side: usize) {
        *lock(&self.end) = Some((link, side));
    }

    /// Close the shared link; each side hears about it once.
    fn shut(&self) {
        let end = lock(&self.end).clone();
        if let Some((link, _)) = end {
            if link.open.swap(false, Ordering::SeqCst) {
                for side in &link.sides {
                    let _ = side.send(TransportEvent::ChannelClosed);
                }
            }
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        lock(&self.end)
            .as_ref()
            .map(|(link, _)| link.open.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let end = lock(&self.end).clone();
        let (link, side) = end.ok_or(TransportError::Closed)?;
        if !link.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        link.sides[1 - side]
            .send(TransportEvent::Frame(text))
            .map_err(|_| TransportError::Send("remote event queue dropped".into()))
    }

    async fn close(&self) {
        self.shut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::transport::TransportEventReceiver;

    fn drain(rx: &mut TransportEventReceiver) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    async fn connected_pair(network: &MemoryNetwork) -> (TransportParts, TransportParts, Arc<dyn DataChannel>) {
        let factory = network.factory();
        let a = factory.create(&[]).await.unwrap();
        let b = factory.create(&[]).await.unwrap();

        let channel = a.transport.create_channel("duel").await.unwrap();
        a.transport.create_offer().await.unwrap();
        let offer = a.transport.local_description().await.unwrap();

        b.transport.apply_remote(&offer).await.unwrap();
        b.transport.create_answer().await.unwrap();
        let answer = b.transport.local_description().await.unwrap();
        assert_eq!(answer.kind(), SignalingKind::Answer);

        a.transport.apply_remote(&answer).await.unwrap();
        (a, b, channel)
    }

    #[tokio::test]
    async fn test_pair_connects_and_exchanges_frames() {
        let network = MemoryNetwork::new();
        let (mut a, mut b, channel) = connected_pair(&network).await;

        let a_events = drain(&mut a.events);
        assert!(a_events.iter().any(|e| matches!(e, TransportEvent::ChannelOpen)));
        assert!(channel.is_open());

        let b_events = drain(&mut b.events);
        let remote = b_events
            .iter()
            .find_map(|e| match e {
                TransportEvent::ChannelAnnounced(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(remote.label(), "duel");

        channel.send_text("hello".into()).await.unwrap();
        remote.send_text("world".into()).await.unwrap();
        assert!(matches!(drain(&mut b.events).as_slice(), [TransportEvent::Frame(f)] if f == "hello"));
        assert!(matches!(drain(&mut a.events).as_slice(), [TransportEvent::Frame(f)] if f == "world"));
    }

    #[tokio::test]
    async fn test_sever_links_closes_both_sides_once() {
        let network = MemoryNetwork::new();
        let (mut a, mut b, channel) = connected_pair(&network).await;
        drain(&mut a.events);
        drain(&mut b.events);

        network.sever_links();
        let a_events = drain(&mut a.events);
        let closes = a_events.iter().filter(|e| matches!(e, TransportEvent::ChannelClosed)).count();
        assert_eq!(closes, 1);
        assert!(a_events.iter().any(|e| matches!(
            e,
            TransportEvent::StateChanged(PeerConnectionState::Disconnected)
        )));
        assert!(drain(&mut b.events).iter().any(|e| matches!(e, TransportEvent::ChannelClosed)));
        assert_eq!(channel.send_text("late".into()).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_answer_without_offer_rejected() {
        let network = MemoryNetwork::new();
        let b = network.factory().create(&[]).await.unwrap();
        assert!(b.transport.create_answer().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_gathering_never_completes() {
        let network = MemoryNetwork::new();
        network.set_gathering(GatheringMode::Stalled);
        let a = network.factory().create(&[]).await.unwrap();
        let waited = tokio::time::timeout(
            Duration::from_secs(10),
            a.transport.wait_gathering_complete(),
        )
        .await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_origin_id() {
        assert_eq!(origin_id("v=0\r\no=- abc 1 IN IP4 x\r\n").as_deref(), Some("abc"));
        assert_eq!(origin_id("v=0\r\n"), None);
    }
}
