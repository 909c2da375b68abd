//! Signaling Exchange
//!
//! Data contract for the offer/answer blobs carried between peers by the user.
//! No network logic lives here.

pub mod blob;

pub use blob::{SignalingBlob, SignalingKind, SignalingError};
