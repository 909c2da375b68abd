//! Peer Transport Seam
//!
//! The negotiator talks to the network through these traits so the same
//! state machine runs over WebRTC in production and over an in-memory
//! loopback in tests. Implementations push everything that happens on the
//! connection (state changes, channel lifecycle, inbound frames) into one
//! event queue; the owning task drains it sequentially.

use std::fmt;
use std::sync::Arc;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::SignalingBlob;
use super::relay::IceServerConfig;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Building the connection or a description failed.
    #[error("transport setup failed: {0}")]
    Setup(String),

    /// The connection is already closed.
    #[error("transport closed")]
    Closed,

    /// A frame could not be queued.
    #[error("send failed: {0}")]
    Send(String),
}

/// Underlying connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// Created, nothing attempted yet.
    New,
    /// Connectivity checks running.
    Connecting,
    /// At least one candidate pair works.
    Connected,
    /// Lost connectivity.
    Disconnected,
    /// Could not connect, or connectivity failed permanently.
    Failed,
    /// Closed locally.
    Closed,
}

/// Everything a transport reports, in order.
#[derive(Clone)]
pub enum TransportEvent {
    /// Connection state changed.
    StateChanged(PeerConnectionState),
    /// The remote peer opened a data channel (responder side).
    ChannelAnnounced(Arc<dyn DataChannel>),
    /// The data channel became writable.
    ChannelOpen,
    /// The data channel closed.
    ChannelClosed,
    /// The data channel reported an error.
    ChannelError(String),
    /// A text frame arrived.
    Frame(String),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::ChannelAnnounced(c) => {
                f.debug_tuple("ChannelAnnounced").field(&c.label()).finish()
            }
            TransportEvent::ChannelOpen => f.write_str("ChannelOpen"),
            TransportEvent::ChannelClosed => f.write_str("ChannelClosed"),
            TransportEvent::ChannelError(e) => f.debug_tuple("ChannelError").field(e).finish(),
            TransportEvent::Frame(raw) => f.debug_tuple("Frame").field(&raw.len()).finish(),
        }
    }
}

/// Sender half of a transport's event queue.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receiver half of a transport's event queue.
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// An ordered, reliable, text-framed data channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label.
    fn label(&self) -> String;

    /// Whether frames can be sent right now.
    fn is_open(&self) -> bool;

    /// Queue one text frame.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Close the channel. Safe to call more than once.
    async fn close(&self);
}

/// One peer connection.
///
/// `create_offer` / `create_answer` also install the result as the local
/// description and start candidate gathering; `wait_gathering_complete`
/// resolves once gathering finishes so the local description is complete.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create the ordered data channel (initiator side).
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Create and install an offer.
    async fn create_offer(&self) -> Result<(), TransportError>;

    /// Create and install an answer. Requires a remote offer.
    async fn create_answer(&self) -> Result<(), TransportError>;

    /// Install the remote description.
    async fn apply_remote(&self, blob: &SignalingBlob) -> Result<(), TransportError>;

    /// Resolve when candidate gathering completes. May never resolve;
    /// callers bound it with a timeout.
    async fn wait_gathering_complete(&self);

    /// Current local description, with whatever candidates are known.
    async fn local_description(&self) -> Option<SignalingBlob>;

    /// Close the connection and release its resources. Safe to call more than once.
    async fn close(&self);
}

/// A freshly created transport and its event queue.
pub struct TransportParts {
    /// The connection.
    pub transport: Arc<dyn PeerTransport>,
    /// Its events.
    pub events: TransportEventReceiver,
}

/// Builds transports for the negotiator.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a new connection using the given ICE servers.
    async fn create(&self, ice_servers: &[IceServerConfig]) -> Result<TransportParts, TransportError>;
}
