//! Remote snapshot: the latest replicated state of the opponent's tank.

use std::time::Duration;
use tokio::time::Instant;

use crate::core::vec3::{Vec3, Quat};
use crate::protocol::envelope::PlayerUpdate;

/// Last `player_update` received from the remote peer. Overwritten on every
/// receipt; only the receive path writes it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RemoteSnapshot {
    /// Hull position.
    pub position: Vec3,
    /// Hull orientation.
    pub orientation: Quat,
    /// Turret yaw.
    pub turret_angle: f32,
    /// Head yaw.
    pub head_angle: f32,
    /// Linear velocity.
    pub velocity: Vec3,
    /// Sender's wall-clock stamp (ms).
    pub sent_at: i64,
    /// Local receive time.
    pub received_at: Instant,
}

impl RemoteSnapshot {
    /// Build from a decoded update.
    pub fn from_update(update: &PlayerUpdate, sent_at: i64, received_at: Instant) -> Self {
        Self {
            position: update.position,
            orientation: update.rotation,
            turret_angle: update.turret_rotation,
            head_angle: update.head_rotation,
            velocity: update.velocity,
            sent_at,
            received_at,
        }
    }

    /// Dead-reckoned position at `now`, never projecting further than `max_ahead`.
    pub fn extrapolate(&self, now: Instant, max_ahead: Duration) -> Vec3 {
        let elapsed = now.saturating_duration_since(self.received_at).min(max_ahead);
        let projected = self.position + self.velocity.scale(elapsed.as_secs_f32());
        if projected.is_finite() {
            projected
        } else {
            self.position
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(x: f32, vx: f32) -> PlayerUpdate {
        PlayerUpdate {
            position: Vec3::new(x, 0.0, 0.0),
            rotation: Quat::IDENTITY,
            head_rotation: 0.0,
            turret_rotation: 0.5,
            velocity: Vec3::new(vx, 0.0, 0.0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_extrapolate_follows_velocity() {
        let t0 = Instant::now();
        let snap = RemoteSnapshot::from_update(&update(1.0, 10.0), 0, t0);
        let at = snap.extrapolate(t0 + Duration::from_millis(20), Duration::from_millis(50));
        assert!((at.x - 1.2).abs() < 1e-4);
        assert_eq!(snap.turret_angle, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extrapolate_is_capped() {
        let t0 = Instant::now();
        let snap = RemoteSnapshot::from_update(&update(0.0, 10.0), 0, t0);
        let at = snap.extrapolate(t0 + Duration::from_secs(5), Duration::from_millis(50));
        assert!((at.x - 0.5).abs() < 1e-4);
    }
}
