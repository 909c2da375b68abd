//! Wire Envelope
//!
//! Every data-channel frame is one JSON object:
//!
//! ```text
//! { "type": "<message kind>", "data": { ... }, "timestamp": <ms since epoch> }
//! ```
//!
//! [`Envelope`] is the raw wire shape with an opaque payload. [`Message`] is
//! the typed view the rest of the crate works with; conversion happens at the
//! channel boundary so a malformed payload is rejected in one place.

use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::core::clock::now_millis;
use crate::core::vec3::{Vec3, Quat};
use crate::replication::map::MapLayout;
use crate::replication::player::{PlayerSlot, TankColor, Username};
use crate::replication::scoreboard::MatchMode;

// =============================================================================
// ERRORS
// =============================================================================

/// Frame decoding errors. Never fatal: the offending frame is dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The envelope parsed but its payload does not fit its kind.
    #[error("bad {kind} payload: {reason}")]
    BadPayload {
        /// Declared kind.
        kind: MessageKind,
        /// Decoder message.
        reason: String,
    },
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Message discriminator carried in the `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Username and color.
    PlayerInfo,
    /// Match configuration and arena (initiator only).
    GameStart,
    /// Periodic pose replication.
    PlayerUpdate,
    /// A shot was fired.
    BulletSpawn,
    /// Sender's locally detected hit on the receiver.
    Damage,
    /// Sender's tank was destroyed.
    Death,
    /// Sender respawned and closed the round.
    RoundEnd,
    /// Responder applied `game_start`.
    Ready,
    /// An obstacle was destroyed.
    ObstacleDestroyed,
    /// Ask the peer for its view of the match.
    SyncRequest,
    /// Answer to `sync_request`.
    SyncResponse,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde name so logs match the wire
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// Raw wire envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Kind-specific payload.
    #[serde(default)]
    pub data: Value,
    /// Sender's wall clock, ms since epoch.
    pub timestamp: i64,
}

impl Envelope {
    /// Wrap a typed message, stamped with the current time.
    pub fn wrap(message: &Message) -> Self {
        Self::wrap_at(message, now_millis())
    }

    /// Wrap a typed message with an explicit timestamp.
    pub fn wrap_at(message: &Message, timestamp: i64) -> Self {
        Self {
            kind: message.kind(),
            data: message.to_data(),
            timestamp,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON text frame.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Decode the payload into its typed message.
    pub fn message(&self) -> Result<Message, ProtocolError> {
        Message::from_parts(self.kind, &self.data)
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// `player_info`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Display name.
    pub username: Username,
    /// Tank color.
    pub color: TankColor,
}

/// `game_start`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStart {
    /// Match mode.
    pub mode: MatchMode,
    /// Full arena layout.
    pub map_data: MapLayout,
}

/// `player_update`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    /// Hull position.
    pub position: Vec3,
    /// Hull orientation.
    pub rotation: Quat,
    /// Head yaw.
    pub head_rotation: f32,
    /// Turret yaw.
    pub turret_rotation: f32,
    /// Linear velocity.
    pub velocity: Vec3,
}

/// `bullet_spawn`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BulletSpawn {
    /// Muzzle position.
    pub position: Vec3,
    /// Unit direction.
    pub direction: Vec3,
}

/// `damage`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Damage {
    /// Health to subtract.
    pub damage: u32,
    /// Tank that was hit.
    pub target: PlayerSlot,
}

/// `round_end`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundEnd {
    /// Round number that just started for the sender.
    pub round: u32,
    /// Sender's view of the initiator's score.
    pub player1_score: u32,
    /// Sender's view of the responder's score.
    pub player2_score: u32,
}

/// `obstacle_destroyed`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObstacleDestroyed {
    /// Obstacle id, e.g. `tree_7`.
    pub id: String,
}

/// `sync_response`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Sender's round counter.
    pub round: u32,
    /// Sender's view of the initiator's score.
    pub player1_score: u32,
    /// Sender's view of the responder's score.
    pub player2_score: u32,
    /// Obstacles the sender has removed.
    pub destroyed: Vec<String>,
}

/// Empty payload (`{}`) for signal-only messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

// =============================================================================
// TYPED MESSAGE
// =============================================================================

/// Typed message carried by an envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Username and color.
    PlayerInfo(PlayerInfo),
    /// Match configuration and arena.
    GameStart(GameStart),
    /// Pose replication.
    PlayerUpdate(PlayerUpdate),
    /// Shot fired.
    BulletSpawn(BulletSpawn),
    /// Hit on the receiver.
    Damage(Damage),
    /// Sender died.
    Death,
    /// Sender respawned.
    RoundEnd(RoundEnd),
    /// Responder is ready.
    Ready,
    /// Obstacle removed.
    ObstacleDestroyed(ObstacleDestroyed),
    /// Request a sync response.
    SyncRequest,
    /// Sender's view of the match.
    SyncResponse(SyncResponse),
}

impl Message {
    /// Wire kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::PlayerInfo(_) => MessageKind::PlayerInfo,
            Message::GameStart(_) => MessageKind::GameStart,
            Message::PlayerUpdate(_) => MessageKind::PlayerUpdate,
            Message::BulletSpawn(_) => MessageKind::BulletSpawn,
            Message::Damage(_) => MessageKind::Damage,
            Message::Death => MessageKind::Death,
            Message::RoundEnd(_) => MessageKind::RoundEnd,
            Message::Ready => MessageKind::Ready,
            Message::ObstacleDestroyed(_) => MessageKind::ObstacleDestroyed,
            Message::SyncRequest => MessageKind::SyncRequest,
            Message::SyncResponse(_) => MessageKind::SyncResponse,
        }
    }

    fn to_data(&self) -> Value {
        let encoded = match self {
            Message::PlayerInfo(p) => serde_json::to_value(p),
            Message::GameStart(p) => serde_json::to_value(p),
            Message::PlayerUpdate(p) => serde_json::to_value(p),
            Message::BulletSpawn(p) => serde_json::to_value(p),
            Message::Damage(p) => serde_json::to_value(p),
            Message::RoundEnd(p) => serde_json::to_value(p),
            Message::ObstacleDestroyed(p) => serde_json::to_value(p),
            Message::SyncResponse(p) => serde_json::to_value(p),
            Message::Death | Message::Ready | Message::SyncRequest => serde_json::to_value(Empty {}),
        };
        // Payload structs hold only plain data; non-finite floats become null
        encoded.unwrap_or_else(|_| Value::Object(Default::default()))
    }

    fn from_parts(kind: MessageKind, data: &Value) -> Result<Self, ProtocolError> {
        Ok(match kind {
            MessageKind::PlayerInfo => Message::PlayerInfo(payload(kind, data)?),
            MessageKind::GameStart => Message::GameStart(payload(kind, data)?),
            MessageKind::PlayerUpdate => Message::PlayerUpdate(payload(kind, data)?),
            MessageKind::BulletSpawn => Message::BulletSpawn(payload(kind, data)?),
            MessageKind::Damage => Message::Damage(payload(kind, data)?),
            MessageKind::Death => Message::Death,
            MessageKind::RoundEnd => Message::RoundEnd(payload(kind, data)?),
            MessageKind::Ready => Message::Ready,
            MessageKind::ObstacleDestroyed => Message::ObstacleDestroyed(payload(kind, data)?),
            MessageKind::SyncRequest => Message::SyncRequest,
            MessageKind::SyncResponse => Message::SyncResponse(payload(kind, data)?),
        })
    }
}

fn payload<T: DeserializeOwned>(kind: MessageKind, data: &Value) -> Result<T, ProtocolError> {
    T::deserialize(data).map_err(|e| ProtocolError::BadPayload { kind, reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::replication::map::MapGenConfig;

    #[test]
    fn test_player_update_wire_shape() {
        let msg = Message::PlayerUpdate(PlayerUpdate {
            position: Vec3::new(1.0, 0.0, 2.0),
            rotation: Quat::IDENTITY,
            head_rotation: 0.25,
            turret_rotation: 1.5,
            velocity: Vec3::ZERO,
        });
        let json: Value = serde_json::from_str(&Envelope::wrap_at(&msg, 1234).to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "player_update");
        assert_eq!(json["timestamp"], 1234);
        assert_eq!(json["data"]["position"], serde_json::json!([1.0, 0.0, 2.0]));
        assert_eq!(json["data"]["headRotation"], 0.25);
        assert_eq!(json["data"]["turretRotation"], 1.5);
    }

    #[test]
    fn test_empty_payloads() {
        let text = Envelope::wrap_at(&Message::Death, 5).to_json().unwrap();
        assert_eq!(text, r#"{"type":"death","data":{},"timestamp":5}"#);

        // A missing data field still decodes for signal-only kinds
        let env = Envelope::from_json(r#"{"type":"ready","timestamp":1}"#).unwrap();
        assert_eq!(env.message().unwrap(), Message::Ready);
    }

    #[test]
    fn test_damage_decode() {
        let env = Envelope::from_json(
            r#"{"type":"damage","data":{"damage":30,"target":"player2"},"timestamp":10}"#,
        )
        .unwrap();
        assert_eq!(
            env.message().unwrap(),
            Message::Damage(Damage { damage: 30, target: PlayerSlot::Player2 })
        );
    }

    #[test]
    fn test_game_start_roundtrip() {
        let layout = MapLayout::generate(3, &MapGenConfig::default());
        let msg = Message::GameStart(GameStart { mode: MatchMode::Bo5, map_data: layout });
        let text = Envelope::wrap(&msg).to_json().unwrap();
        assert!(text.contains("\"mapData\""));
        let back = Envelope::from_json(&text).unwrap().message().unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(Envelope::from_json("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            Envelope::from_json(r#"{"type":"teleport","data":{},"timestamp":1}"#),
            Err(ProtocolError::Malformed(_))
        ));

        let env = Envelope::from_json(r#"{"type":"damage","data":{"damage":"lots"},"timestamp":1}"#).unwrap();
        assert!(matches!(env.message(), Err(ProtocolError::BadPayload { kind: MessageKind::Damage, .. })));
    }

    #[test]
    fn test_kind_display_matches_wire() {
        assert_eq!(MessageKind::ObstacleDestroyed.to_string(), "obstacle_destroyed");
    }

    fn vec3() -> impl Strategy<Value = Vec3> {
        (-100.0f32..100.0, -5.0f32..5.0, -100.0f32..100.0).prop_map(|(x, y, z)| Vec3::new(x, y, z))
    }

    fn slot() -> impl Strategy<Value = PlayerSlot> {
        prop_oneof![Just(PlayerSlot::Player1), Just(PlayerSlot::Player2)]
    }

    fn color() -> impl Strategy<Value = TankColor> {
        prop_oneof![
            Just(TankColor::Red),
            Just(TankColor::Blue),
            Just(TankColor::Green),
            Just(TankColor::Yellow),
            Just(TankColor::Purple),
            Just(TankColor::Orange),
        ]
    }

    fn mode() -> impl Strategy<Value = MatchMode> {
        prop_oneof![Just(MatchMode::Bo3), Just(MatchMode::Bo5), Just(MatchMode::Infinite)]
    }

    fn obstacle_id() -> impl Strategy<Value = String> {
        "(tree|rock)_[0-9]{1,2}"
    }

    fn message() -> impl Strategy<Value = Message> {
        prop_oneof![
            ("[a-zA-Z0-9]{3,12}", color()).prop_map(|(name, color)| {
                let username = Username::parse(&name).unwrap();
                Message::PlayerInfo(PlayerInfo { username, color })
            }),
            (mode(), any::<u64>()).prop_map(|(mode, seed)| {
                let map_data = MapLayout::generate(seed, &MapGenConfig::default());
                Message::GameStart(GameStart { mode, map_data })
            }),
            (vec3(), -3.2f32..3.2, -3.2f32..3.2, vec3()).prop_map(|(position, head, turret, velocity)| {
                Message::PlayerUpdate(PlayerUpdate {
                    position,
                    rotation: Quat::from_yaw(head),
                    head_rotation: head,
                    turret_rotation: turret,
                    velocity,
                })
            }),
            (vec3(), vec3()).prop_map(|(position, direction)| {
                Message::BulletSpawn(BulletSpawn { position, direction })
            }),
            (0u32..200, slot()).prop_map(|(damage, target)| Message::Damage(Damage { damage, target })),
            Just(Message::Death),
            (0u32..50, 0u32..10, 0u32..10).prop_map(|(round, player1_score, player2_score)| {
                Message::RoundEnd(RoundEnd { round, player1_score, player2_score })
            }),
            Just(Message::Ready),
            obstacle_id().prop_map(|id| Message::ObstacleDestroyed(ObstacleDestroyed { id })),
            Just(Message::SyncRequest),
            (0u32..50, 0u32..10, 0u32..10, prop::collection::vec(obstacle_id(), 0..8)).prop_map(
                |(round, player1_score, player2_score, destroyed)| {
                    Message::SyncResponse(SyncResponse { round, player1_score, player2_score, destroyed })
                }
            ),
        ]
    }

    #[test]
    fn test_message_strategy_covers_every_kind() {
        use proptest::strategy::ValueTree;
        use proptest::test_runner::TestRunner;
        use std::collections::HashSet;

        let strategy = message();
        let mut runner = TestRunner::deterministic();
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            seen.insert(strategy.new_tree(&mut runner).unwrap().current().kind());
        }
        assert_eq!(seen.len(), 11);
    }

    proptest! {
        #[test]
        fn prop_envelope_roundtrip(msg in message(), ts in 0i64..4_000_000_000_000) {
            let env = Envelope::wrap_at(&msg, ts);
            let back = Envelope::from_json(&env.to_json().unwrap()).unwrap();
            prop_assert_eq!(back.kind, msg.kind());
            prop_assert_eq!(back.timestamp, ts);
            prop_assert_eq!(back.message().unwrap(), msg);
        }
    }
}
