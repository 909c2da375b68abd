//! Arena Layout
//!
//! Deterministic obstacle placement from a seed, plus the live set of
//! obstacles that shrinks as they are destroyed. The initiator generates the
//! layout and ships it inside `game_start`; the responder never generates.

use std::collections::{BTreeMap, BTreeSet};
use serde::{Serialize, Deserialize};

use crate::core::rng::DeterministicRng;
use crate::core::vec3::{Vec3, Quat};
use super::player::PlayerSlot;

/// Distance from the arena center to each spawn point along z.
pub const SPAWN_OFFSET: f32 = 35.0;

/// Destructible obstacle kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObstacleKind {
    /// Tree
    Tree,
    /// Rock
    Rock,
    /// Crate
    Crate,
}

impl ObstacleKind {
    fn prefix(self) -> &'static str {
        match self {
            ObstacleKind::Tree => "tree",
            ObstacleKind::Rock => "rock",
            ObstacleKind::Crate => "crate",
        }
    }
}

/// One placed obstacle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    /// Stable id, e.g. `tree_7`.
    pub id: String,
    /// Kind.
    pub kind: ObstacleKind,
    /// Ground position.
    pub position: Vec3,
    /// Yaw in radians.
    pub rotation: f32,
    /// Uniform scale.
    pub scale: f32,
}

/// Placement parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct MapGenConfig {
    /// Obstacles are placed in `[-half_extent, half_extent]` on x and z.
    pub half_extent: f32,
    /// Tree count.
    pub trees: u32,
    /// Rock count.
    pub rocks: u32,
    /// Crate count.
    pub crates: u32,
    /// Keep this far away from both spawn points.
    pub spawn_clearance: f32,
    /// Minimum distance between two obstacles.
    pub min_spacing: f32,
    /// Placement attempts per obstacle before giving up on it.
    pub max_attempts: u32,
}

impl Default for MapGenConfig {
    fn default() -> Self {
        Self {
            half_extent: 45.0,
            trees: 18,
            rocks: 10,
            crates: 8,
            spawn_clearance: 8.0,
            min_spacing: 3.0,
            max_attempts: 32,
        }
    }
}

/// Complete arena description carried by `game_start`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapLayout {
    /// Seed the layout was generated from.
    pub seed: u64,
    /// Obstacles in generation order.
    pub obstacles: Vec<Obstacle>,
}

impl MapLayout {
    /// Generate a layout. Same seed and config always give the same layout.
    pub fn generate(seed: u64, config: &MapGenConfig) -> Self {
        let mut rng = DeterministicRng::new(seed);
        let mut obstacles: Vec<Obstacle> = Vec::new();
        let spawns = [spawn_point(PlayerSlot::Player1).0, spawn_point(PlayerSlot::Player2).0];

        let plan = [
            (ObstacleKind::Tree, config.trees, 0.8, 1.4),
            (ObstacleKind::Rock, config.rocks, 0.6, 1.8),
            (ObstacleKind::Crate, config.crates, 1.0, 1.0),
        ];

        for (kind, count, min_scale, max_scale) in plan {
            let mut index = 0u32;
            for _ in 0..count {
                let placed = (0..config.max_attempts).find_map(|_| {
                    let position = Vec3::new(
                        rng.next_range(-config.half_extent, config.half_extent),
                        0.0,
                        rng.next_range(-config.half_extent, config.half_extent),
                    );
                    let clear_of_spawns = spawns
                        .iter()
                        .all(|s| s.distance(position) >= config.spawn_clearance);
                    let clear_of_others = obstacles
                        .iter()
                        .all(|o| o.position.distance(position) >= config.min_spacing);
                    (clear_of_spawns && clear_of_others).then_some(position)
                });

                if let Some(position) = placed {
                    obstacles.push(Obstacle {
                        id: format!("{}_{}", kind.prefix(), index),
                        kind,
                        position,
                        rotation: rng.next_angle(),
                        scale: rng.next_range(min_scale, max_scale),
                    });
                    index += 1;
                }
            }
        }

        Self { seed, obstacles }
    }

    /// Generate from a fresh random seed.
    pub fn random(config: &MapGenConfig) -> Self {
        Self::generate(rand::random::<u64>(), config)
    }
}

/// Spawn position and facing for a slot. Tanks face each other across the arena.
pub fn spawn_point(slot: PlayerSlot) -> (Vec3, Quat) {
    match slot {
        PlayerSlot::Player1 => (Vec3::new(0.0, 0.0, -SPAWN_OFFSET), Quat::IDENTITY),
        PlayerSlot::Player2 => {
            (Vec3::new(0.0, 0.0, SPAWN_OFFSET), Quat::from_yaw(std::f32::consts::PI))
        }
    }
}

/// Obstacles still standing this match.
#[derive(Clone, Debug, Default)]
pub struct ObstacleField {
    standing: BTreeMap<String, Obstacle>,
    destroyed: BTreeSet<String>,
}

impl ObstacleField {
    /// Populate from a layout.
    pub fn from_layout(layout: &MapLayout) -> Self {
        Self {
            standing: layout
                .obstacles
                .iter()
                .map(|o| (o.id.clone(), o.clone()))
                .collect(),
            destroyed: BTreeSet::new(),
        }
    }

    /// Remove an obstacle. Returns false if it was unknown or already gone.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.standing.remove(id) {
            Some(_) => {
                self.destroyed.insert(id.to_string());
                true
            }
            None => false,
        }
    }

    /// Whether an obstacle is still standing.
    pub fn is_standing(&self, id: &str) -> bool {
        self.standing.contains_key(id)
    }

    /// Standing obstacle count.
    pub fn remaining(&self) -> usize {
        self.standing.len()
    }

    /// Ids removed so far, sorted.
    pub fn destroyed_ids(&self) -> Vec<String> {
        self.destroyed.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_deterministic() {
        let config = MapGenConfig::default();
        assert_eq!(MapLayout::generate(42, &config), MapLayout::generate(42, &config));
        assert_ne!(MapLayout::generate(42, &config), MapLayout::generate(43, &config));
    }

    #[test]
    fn test_random_layout_replays_from_its_seed() {
        let config = MapGenConfig::default();
        let layout = MapLayout::random(&config);
        assert_eq!(MapLayout::generate(layout.seed, &config), layout);
    }

    #[test]
    fn test_generation_respects_spawn_clearance() {
        let config = MapGenConfig::default();
        let layout = MapLayout::generate(7, &config);
        assert!(!layout.obstacles.is_empty());
        for slot in [PlayerSlot::Player1, PlayerSlot::Player2] {
            let (spawn, _) = spawn_point(slot);
            for obstacle in &layout.obstacles {
                assert!(obstacle.position.distance(spawn) >= config.spawn_clearance);
            }
        }
    }

    #[test]
    fn test_obstacle_ids_unique() {
        let layout = MapLayout::generate(99, &MapGenConfig::default());
        let ids: BTreeSet<_> = layout.obstacles.iter().map(|o| o.id.clone()).collect();
        assert_eq!(ids.len(), layout.obstacles.len());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let layout = MapLayout {
            seed: 0,
            obstacles: vec![Obstacle {
                id: "tree_7".into(),
                kind: ObstacleKind::Tree,
                position: Vec3::new(1.0, 0.0, 1.0),
                rotation: 0.0,
                scale: 1.0,
            }],
        };
        let mut field = ObstacleField::from_layout(&layout);
        assert!(field.remove("tree_7"));
        assert!(!field.remove("tree_7"));
        assert!(!field.remove("rock_1"));
        assert_eq!(field.remaining(), 0);
        assert_eq!(field.destroyed_ids(), vec!["tree_7".to_string()]);
    }

    #[test]
    fn test_layout_json_shape() {
        let layout = MapLayout::generate(1, &MapGenConfig { trees: 1, rocks: 0, crates: 0, ..Default::default() });
        let json = serde_json::to_value(&layout).unwrap();
        assert_eq!(json["obstacles"][0]["kind"], "tree");
        assert_eq!(json["obstacles"][0]["id"], "tree_0");
        assert!(json["obstacles"][0]["position"].is_array());
    }
}
