//! # Tank Duel
//!
//! Serverless two-player tank duel: peers negotiate a direct connection by
//! exchanging offer and answer blobs by hand, then replicate match state over
//! one ordered data channel with no server in between.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TANK DUEL                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  ├── rng.rs      - Seeded Xorshift128+ for arena placement   │
//! │  ├── vec3.rs     - Positions and orientations                │
//! │  └── clock.rs    - Wall-clock envelope timestamps            │
//! │                                                              │
//! │  signaling/      - Offer/answer blob codec                   │
//! │                                                              │
//! │  session/        - Peer session                              │
//! │  ├── transport.rs- Transport seam (connection + channel)     │
//! │  ├── webrtc.rs   - WebRTC transport                          │
//! │  ├── memory.rs   - In-process loopback transport             │
//! │  ├── relay.rs    - ICE servers and relay credentials         │
//! │  └── negotiator.rs - Offer/answer state machine              │
//! │                                                              │
//! │  protocol/       - Data channel wire format                  │
//! │  ├── envelope.rs - JSON envelope and payloads                │
//! │  └── channel.rs  - Typed send/receive                        │
//! │                                                              │
//! │  replication/    - Authority-split match state               │
//! │  ├── player.rs   - Profiles and tank records                 │
//! │  ├── scoreboard.rs - Modes and win thresholds                │
//! │  ├── map.rs      - Arena layout and obstacles                │
//! │  ├── snapshot.rs - Remote pose extrapolation                 │
//! │  └── coordinator.rs - Inbound/outbound replication rules     │
//! │                                                              │
//! │  game/           - Match flow                                │
//! │  ├── machine.rs  - Lobby .. Finished phases                  │
//! │  ├── cutscene.rs - Result presentation                       │
//! │  └── controller.rs - The task that drives it all             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority
//!
//! Each peer is authoritative for its own tank. A shooter never applies
//! damage to its opponent; it reports the hit and the victim applies it,
//! announces its own death and respawn. Scores move only on deaths, so both
//! peers always agree on the score without a referee.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod config;
pub mod signaling;
pub mod session;
pub mod protocol;
pub mod replication;
pub mod game;

// Re-export commonly used types
pub use config::DuelConfig;
pub use signaling::{SignalingBlob, SignalingKind, SignalingError};
pub use session::{Role, SessionEvent, SessionNegotiator, NegotiatorState};
pub use protocol::{ChannelProtocol, Envelope, Message, MessageKind};
pub use replication::{PlayerProfile, PlayerSlot, ReplicationCoordinator, MatchMode};
pub use game::{MatchController, MatchPhase, MatchStateMachine};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default pose replication rate (Hz)
pub const DEFAULT_TICK_RATE: u32 = 20;

/// Default delay between a tank's death and its respawn (ms)
pub const DEFAULT_RESPAWN_DELAY_MS: u64 = 2000;
