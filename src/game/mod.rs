//! Match Flow
//!
//! Sequencing of one match on one peer and the task that drives it.
//!
//! ## Module Structure
//!
//! - `machine`: Lobby to Finished phase machine
//! - `cutscene`: End-of-match result presentation
//! - `controller`: The task owning session, protocol, replication and machine

pub mod machine;
pub mod cutscene;
pub mod controller;

pub use machine::{MatchEvent, MatchPhase, MatchResultView, MatchStateMachine, ResultEntry};
pub use cutscene::{CutsceneEvent, CutscenePhase, EffectCue, ResultPresenter, ScriptedCutscene};
pub use controller::{
    ControllerCommand, ControllerError, ControllerEvent, ControllerHandle, MatchController,
};
