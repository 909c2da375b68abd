//! Peer Session
//!
//! Negotiates a direct peer connection from a manually exchanged offer and
//! answer, and owns it until it connects, fails, drops or is cancelled.

pub mod transport;
pub mod relay;
pub mod webrtc;
pub mod memory;
pub mod negotiator;

pub use transport::{
    DataChannel, PeerConnectionState, PeerTransport, TransportError, TransportEvent,
    TransportFactory, TransportParts,
};
pub use relay::{IceServerConfig, RelayError, resolve_ice_servers};
pub use negotiator::{
    NegotiationError, NegotiatorConfig, NegotiatorState, Role, SessionEvent, SessionNegotiator,
};
