//! Core primitives shared by every layer.

pub mod rng;
pub mod vec3;
pub mod clock;

pub use rng::DeterministicRng;
pub use vec3::{Vec3, Quat};
pub use clock::now_millis;
