//! Match Rules & Scores
//!
//! Game mode, win threshold and the score line shared by round-end and
//! sync messages.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};

use super::player::PlayerSlot;

/// Match length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchMode {
    /// Best of three: first to 2.
    #[serde(rename = "bo3")]
    Bo3,
    /// Best of five: first to 3.
    #[serde(rename = "bo5")]
    Bo5,
    /// Endless deathmatch.
    #[serde(rename = "infinite")]
    Infinite,
}

impl MatchMode {
    /// Rounds needed to win, if any.
    pub fn win_threshold(self) -> WinThreshold {
        match self {
            MatchMode::Bo3 => WinThreshold::Score(2),
            MatchMode::Bo5 => WinThreshold::Score(3),
            MatchMode::Infinite => WinThreshold::Unbounded,
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Bo3 => f.write_str("bo3"),
            MatchMode::Bo5 => f.write_str("bo5"),
            MatchMode::Infinite => f.write_str("infinite"),
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bo3" => Ok(MatchMode::Bo3),
            "bo5" => Ok(MatchMode::Bo5),
            "infinite" | "deathmatch" => Ok(MatchMode::Infinite),
            other => Err(format!("unknown match mode '{other}' (expected bo3, bo5 or infinite)")),
        }
    }
}

/// Score that ends the match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WinThreshold {
    /// First player to reach this many rounds wins.
    Score(u32),
    /// The match never ends on score.
    Unbounded,
}

impl WinThreshold {
    /// Whether `score` ends the match.
    pub fn is_reached(self, score: u32) -> bool {
        match self {
            WinThreshold::Score(target) => score >= target,
            WinThreshold::Unbounded => false,
        }
    }
}

/// Match configuration chosen by the initiator. Immutable for the match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatchConfig {
    mode: MatchMode,
    win_threshold: WinThreshold,
}

impl MatchConfig {
    /// Derive the configuration for a mode.
    pub fn new(mode: MatchMode) -> Self {
        Self { mode, win_threshold: mode.win_threshold() }
    }

    /// Match mode.
    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Win threshold.
    pub fn win_threshold(&self) -> WinThreshold {
        self.win_threshold
    }
}

/// Both scores, indexed by slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreLine {
    /// Initiator's rounds.
    pub player1: u32,
    /// Responder's rounds.
    pub player2: u32,
}

impl ScoreLine {
    /// Score for a slot.
    pub fn get(&self, slot: PlayerSlot) -> u32 {
        match slot {
            PlayerSlot::Player1 => self.player1,
            PlayerSlot::Player2 => self.player2,
        }
    }

    /// Sum of both scores; equals deaths observed.
    pub fn total(&self) -> u32 {
        self.player1 + self.player2
    }

    /// The larger of the two scores.
    pub fn highest(&self) -> u32 {
        self.player1.max(self.player2)
    }

    /// Slot with the strictly higher score.
    pub fn leader(&self) -> Option<PlayerSlot> {
        match self.player1.cmp(&self.player2) {
            Ordering::Greater => Some(PlayerSlot::Player1),
            Ordering::Less => Some(PlayerSlot::Player2),
            Ordering::Equal => None,
        }
    }
}

impl fmt::Display for ScoreLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.player1, self.player2)
    }
}
