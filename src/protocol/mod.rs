//! Data Channel Protocol
//!
//! JSON envelopes over the ordered data channel, and the typed send/receive
//! layer on top of them.

pub mod envelope;
pub mod channel;

pub use envelope::{Envelope, Message, MessageKind, ProtocolError};
pub use channel::{ChannelEvent, ChannelLifecycle, ChannelProtocol, Received};
