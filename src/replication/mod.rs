//! State Replication
//!
//! Per-tank records, match rules, the arena and the coordinator that keeps
//! two peers' views of one match consistent.

pub mod player;
pub mod scoreboard;
pub mod map;
pub mod snapshot;
pub mod coordinator;

pub use player::{PlayerProfile, PlayerRecord, PlayerSlot, ProfileError, TankColor, TankPose, Username, MAX_HEALTH};
pub use scoreboard::{MatchConfig, MatchMode, ScoreLine, WinThreshold};
pub use map::{MapGenConfig, MapLayout, Obstacle, ObstacleField, ObstacleKind};
pub use snapshot::RemoteSnapshot;
pub use coordinator::{ReplicationCoordinator, ReplicationError, ReplicationEvent, ReplicationUpdate};
