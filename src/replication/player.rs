//! Player Records
//!
//! Profiles, slots and the per-tank record each peer keeps for both tanks.
//! Health is only writable from inside the replication layer so that the
//! authority rule (a peer is the sole writer of its own health) holds by
//! construction.

use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::vec3::{Vec3, Quat};

/// Full health for a freshly spawned tank.
pub const MAX_HEALTH: u32 = 100;

/// Username length bounds (inclusive).
pub const USERNAME_MIN_LEN: usize = 3;
/// Username length bounds (inclusive).
pub const USERNAME_MAX_LEN: usize = 12;

// =============================================================================
// SLOTS
// =============================================================================

/// Which of the two tanks a record describes.
///
/// `Player1` always belongs to the peer that initiated negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerSlot {
    /// The initiator's tank.
    #[serde(rename = "player1")]
    Player1,
    /// The responder's tank.
    #[serde(rename = "player2")]
    Player2,
}

impl PlayerSlot {
    /// The other tank.
    pub fn opponent(self) -> Self {
        match self {
            PlayerSlot::Player1 => PlayerSlot::Player2,
            PlayerSlot::Player2 => PlayerSlot::Player1,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            PlayerSlot::Player1 => "player1",
            PlayerSlot::Player2 => "player2",
        }
    }
}

impl fmt::Display for PlayerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PROFILE
// =============================================================================

/// Profile entry errors. Each names the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    /// Username length or alphabet is wrong.
    #[error("username: must be {USERNAME_MIN_LEN}-{USERNAME_MAX_LEN} letters or digits")]
    InvalidUsername,

    /// Color is not in the palette.
    #[error("color: '{0}' is not one of red, blue, green, yellow, purple, orange")]
    InvalidColor(String),
}

impl ProfileError {
    /// Form field the error belongs to.
    pub fn field(&self) -> &'static str {
        match self {
            ProfileError::InvalidUsername => "username",
            ProfileError::InvalidColor(_) => "color",
        }
    }
}

/// Validated display name: 3 to 12 ASCII letters or digits.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    /// Validate a raw username.
    pub fn parse(raw: &str) -> Result<Self, ProfileError> {
        let len = raw.chars().count();
        if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len)
            || !raw.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ProfileError::InvalidUsername);
        }
        Ok(Self(raw.to_string()))
    }

    /// Borrow as str.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = ProfileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Username::parse(&value)
    }
}

impl From<Username> for String {
    fn from(value: Username) -> Self {
        value.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tank paint palette.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TankColor {
    /// Red
    Red,
    /// Blue
    Blue,
    /// Green
    Green,
    /// Yellow
    Yellow,
    /// Purple
    Purple,
    /// Orange
    Orange,
}

impl FromStr for TankColor {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "red" => Ok(TankColor::Red),
            "blue" => Ok(TankColor::Blue),
            "green" => Ok(TankColor::Green),
            "yellow" => Ok(TankColor::Yellow),
            "purple" => Ok(TankColor::Purple),
            "orange" => Ok(TankColor::Orange),
            _ => Err(ProfileError::InvalidColor(s.to_string())),
        }
    }
}

/// What a player enters before hosting or joining.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProfile {
    /// Display name.
    pub username: Username,
    /// Tank color.
    pub color: TankColor,
}

impl PlayerProfile {
    /// Validate both fields. Username is checked first.
    pub fn new(username: &str, color: &str) -> Result<Self, ProfileError> {
        Ok(Self {
            username: Username::parse(username)?,
            color: color.parse()?,
        })
    }
}

// =============================================================================
// POSE & RECORD
// =============================================================================

/// Kinematic state of one tank as replicated over the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TankPose {
    /// Hull position.
    pub position: Vec3,
    /// Hull orientation.
    pub rotation: Quat,
    /// Head (commander hatch) yaw in radians.
    pub head_rotation: f32,
    /// Turret yaw in radians.
    pub turret_rotation: f32,
    /// Linear velocity.
    pub velocity: Vec3,
}

/// One tank's match record.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerRecord {
    slot: PlayerSlot,
    profile: Option<PlayerProfile>,
    score: u32,
    health: u32,
    alive: bool,
    pose: TankPose,
}

impl PlayerRecord {
    /// Fresh record at full health.
    pub fn new(slot: PlayerSlot, profile: Option<PlayerProfile>) -> Self {
        Self {
            slot,
            profile,
            score: 0,
            health: MAX_HEALTH,
            alive: true,
            pose: TankPose::default(),
        }
    }

    /// Slot this record describes.
    pub fn slot(&self) -> PlayerSlot {
        self.slot
    }

    /// Profile, if known (the remote profile arrives with `player_info`).
    pub fn profile(&self) -> Option<&PlayerProfile> {
        self.profile.as_ref()
    }

    /// Name to show, falling back to the slot name.
    pub fn display_name(&self) -> String {
        self.profile
            .as_ref()
            .map(|p| p.username.to_string())
            .unwrap_or_else(|| self.slot.to_string())
    }

    /// Rounds won.
    pub fn score(&self) -> u32 {
        self.score
    }

    /// Current health, 0..=100.
    pub fn health(&self) -> u32 {
        self.health
    }

    /// False between death and respawn.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Last known pose.
    pub fn pose(&self) -> &TankPose {
        &self.pose
    }

    pub(crate) fn set_profile(&mut self, profile: PlayerProfile) {
        self.profile = Some(profile);
    }

    pub(crate) fn set_pose(&mut self, pose: TankPose) {
        self.pose = pose;
    }

    /// Subtract damage. Returns true if this hit killed the tank.
    pub(crate) fn take_damage(&mut self, amount: u32) -> bool {
        if !self.alive {
            return false;
        }
        self.health = self.health.saturating_sub(amount);
        if self.health == 0 {
            self.alive = false;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_dead(&mut self) {
        self.health = 0;
        self.alive = false;
    }

    pub(crate) fn restore(&mut self) {
        self.health = MAX_HEALTH;
        self.alive = true;
    }

    pub(crate) fn award_point(&mut self) {
        self.score += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_bounds() {
        assert!(Username::parse("abc").is_ok());
        assert!(Username::parse("abcdefghijkl").is_ok());
        assert_eq!(Username::parse("ab"), Err(ProfileError::InvalidUsername));
        assert_eq!(Username::parse("abcdefghijklm"), Err(ProfileError::InvalidUsername));
    }

    #[test]
    fn test_username_alphabet() {
        assert!(Username::parse("Tank42").is_ok());
        assert_eq!(Username::parse("tank 42"), Err(ProfileError::InvalidUsername));
        assert_eq!(Username::parse("tänk"), Err(ProfileError::InvalidUsername));
        assert_eq!(Username::parse("a_b_c"), Err(ProfileError::InvalidUsername));
    }

    #[test]
    fn test_profile_field_errors() {
        let err = PlayerProfile::new("x", "red").unwrap_err();
        assert_eq!(err.field(), "username");

        let err = PlayerProfile::new("alice", "magenta").unwrap_err();
        assert_eq!(err.field(), "color");
        assert!(err.to_string().starts_with("color:"));
    }

    #[test]
    fn test_color_parse_case_insensitive() {
        assert_eq!("Blue".parse::<TankColor>().unwrap(), TankColor::Blue);
        assert_eq!(" orange ".parse::<TankColor>().unwrap(), TankColor::Orange);
    }

    #[test]
    fn test_slot_wire_names() {
        assert_eq!(serde_json::to_string(&PlayerSlot::Player2).unwrap(), "\"player2\"");
        assert_eq!(PlayerSlot::Player1.opponent(), PlayerSlot::Player2);
    }

    #[test]
    fn test_username_deserialize_validates() {
        assert!(serde_json::from_str::<Username>("\"ok123\"").is_ok());
        assert!(serde_json::from_str::<Username>("\"no\"").is_err());
    }

    #[test]
    fn test_take_damage_kills_once() {
        let mut record = PlayerRecord::new(PlayerSlot::Player1, None);
        assert!(!record.take_damage(60));
        assert_eq!(record.health(), 40);
        assert!(record.take_damage(60));
        assert_eq!(record.health(), 0);
        assert!(!record.is_alive());
        // Already dead: further hits are ignored
        assert!(!record.take_damage(10));
    }

    #[test]
    fn test_display_name_fallback() {
        let record = PlayerRecord::new(PlayerSlot::Player2, None);
        assert_eq!(record.display_name(), "player2");
    }
}
