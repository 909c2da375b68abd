//! Match State Machine
//!
//! Sequences one match on one peer:
//!
//! ```text
//! Lobby -> Negotiating -> AwaitingReady -> Active <-> RoundTransition
//!                                            |              |
//!                                            +-> Finished <-+
//!                                                   |
//!                                                 Lobby
//! ```
//!
//! Session failure, timeout, drop or cancel returns to Lobby from any phase
//! except Finished (the result screen plays out on its own). Input is
//! enabled exactly while the phase is Active.
//!
//! Finished holds the result for a short settle window before asking for the
//! presentation. A death that crossed ours on the wire lands inside that
//! window and replaces the result, so both peers present the same outcome.
//!
//! The machine is pure: every input returns the [`MatchEvent`]s it caused
//! and the owning controller acts on them.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::replication::coordinator::ReplicationEvent;
use crate::replication::player::{PlayerSlot, TankColor};
use crate::session::negotiator::{Role, SessionEvent};

/// Match phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// No session.
    Lobby,
    /// Session being negotiated.
    Negotiating,
    /// Connected; waiting for the match configuration handshake.
    AwaitingReady,
    /// Round in progress, input enabled.
    Active,
    /// Local tank destroyed, waiting to respawn.
    RoundTransition,
    /// Someone reached the win threshold; result settling or presenting.
    Finished,
}

/// One side of the result screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    /// Display name.
    pub name: String,
    /// Tank color, if known.
    pub color: Option<TankColor>,
    /// Final score.
    pub score: u32,
}

/// Everything the result presenter needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResultView {
    /// Winning slot; `None` for a draw.
    pub winner: Option<PlayerSlot>,
    /// This peer's slot.
    pub local_slot: PlayerSlot,
    /// Initiator's entry.
    pub player1: ResultEntry,
    /// Responder's entry.
    pub player2: ResultEntry,
}

impl MatchResultView {
    /// Whether the local player won.
    pub fn local_won(&self) -> bool {
        self.winner == Some(self.local_slot)
    }

    /// Level scores at the end.
    pub fn is_draw(&self) -> bool {
        self.winner.is_none()
    }

    /// Entry for a slot.
    pub fn entry(&self, slot: PlayerSlot) -> &ResultEntry {
        match slot {
            PlayerSlot::Player1 => &self.player1,
            PlayerSlot::Player2 => &self.player2,
        }
    }
}

/// What the machine asks its owner to do or show.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchEvent {
    /// Phase transition.
    PhaseChanged {
        /// Previous phase.
        from: MatchPhase,
        /// New phase.
        to: MatchPhase,
    },
    /// Enable or freeze local tank input.
    InputEnabled(bool),
    /// Show a transient notice.
    Notice(String),
    /// Respawn the local tank now.
    RespawnLocal,
    /// Play the result presentation.
    PresentResult(MatchResultView),
    /// Tear the session down.
    TeardownSession,
}

/// Per-peer match sequencing.
pub struct MatchStateMachine {
    phase: MatchPhase,
    role: Option<Role>,
    respawn_delay: Duration,
    respawn_at: Option<Instant>,
    result_settle: Duration,
    result_at: Option<Instant>,
    result: Option<MatchResultView>,
    event_tx: broadcast::Sender<MatchEvent>,
}

impl MatchStateMachine {
    /// New machine in Lobby.
    pub fn new(respawn_delay: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            phase: MatchPhase::Lobby,
            role: None,
            respawn_delay,
            respawn_at: None,
            result_settle: Duration::ZERO,
            result_at: None,
            result: None,
            event_tx,
        }
    }

    /// Hold a finished match's result this long before presenting it.
    pub fn with_result_settle(mut self, settle: Duration) -> Self {
        self.result_settle = settle;
        self
    }

    /// Current phase.
    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Role of the current session.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Local input allowed.
    pub fn input_enabled(&self) -> bool {
        self.phase == MatchPhase::Active
    }

    /// When the local tank respawns, while in RoundTransition.
    pub fn respawn_deadline(&self) -> Option<Instant> {
        self.respawn_at
    }

    /// When the settled result is presented, while in Finished.
    pub fn result_deadline(&self) -> Option<Instant> {
        self.result_at
    }

    /// Subscribe to match events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MatchEvent> {
        self.event_tx.subscribe()
    }

    // =========================================================================
    // INPUTS
    // =========================================================================

    /// The user chose to host or join.
    pub fn begin_negotiation(&mut self, role: Role) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        if self.phase != MatchPhase::Lobby {
            debug!("Cannot negotiate from {:?}", self.phase);
            return out;
        }
        self.role = Some(role);
        self.transition(MatchPhase::Negotiating, &mut out);
        self.publish(out)
    }

    /// Fold a session event.
    pub fn on_session_event(&mut self, event: &SessionEvent) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        match event {
            SessionEvent::Connected => {
                if self.phase == MatchPhase::Negotiating {
                    self.transition(MatchPhase::AwaitingReady, &mut out);
                }
            }
            SessionEvent::TimedOut => self.abandon(Some("Connection timed out"), &mut out),
            SessionEvent::Failed(reason) => {
                self.abandon(Some(&format!("Connection failed: {reason}")), &mut out)
            }
            SessionEvent::Disconnected => self.abandon(Some("Opponent disconnected"), &mut out),
            SessionEvent::Cancelled => self.abandon(None, &mut out),
            SessionEvent::SetupFailed(reason) => {
                out.push(MatchEvent::Notice(format!("Could not start session: {reason}")));
            }
            SessionEvent::StateChanged { .. } | SessionEvent::LocalDescriptionReady(_) => {}
        }
        self.publish(out)
    }

    /// Fold a replication event. `MatchOver` is handled by [`finish`](Self::finish).
    pub fn on_replication_event(&mut self, event: &ReplicationEvent, now: Instant) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        match event {
            ReplicationEvent::MatchConfigured { .. } if self.role == Some(Role::Responder) => {
                if self.phase == MatchPhase::AwaitingReady {
                    self.transition(MatchPhase::Active, &mut out);
                }
            }
            ReplicationEvent::RemoteReady if self.role == Some(Role::Initiator) => {
                if self.phase == MatchPhase::AwaitingReady {
                    self.transition(MatchPhase::Active, &mut out);
                }
            }
            ReplicationEvent::LocalDied => {
                if self.phase == MatchPhase::Active {
                    self.respawn_at = Some(now + self.respawn_delay);
                    self.transition(MatchPhase::RoundTransition, &mut out);
                    out.push(MatchEvent::Notice("Destroyed! Respawning...".into()));
                }
            }
            ReplicationEvent::RemoteDied => {
                out.push(MatchEvent::Notice("Opponent destroyed".into()));
            }
            _ => {}
        }
        self.publish(out)
    }

    /// The respawn timer fired.
    pub fn on_respawn_due(&mut self, now: Instant) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        match self.respawn_at {
            Some(at) if self.phase == MatchPhase::RoundTransition && now >= at => {
                self.respawn_at = None;
                out.push(MatchEvent::RespawnLocal);
                self.transition(MatchPhase::Active, &mut out);
            }
            _ => {}
        }
        self.publish(out)
    }

    /// A player reached the win threshold. While the result is still
    /// settling a later call replaces it.
    pub fn finish(&mut self, result: MatchResultView, now: Instant) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        match self.phase {
            MatchPhase::Active | MatchPhase::RoundTransition => {
                self.respawn_at = None;
                self.result_at = Some(now + self.result_settle);
                match result.winner {
                    Some(slot) => info!("Match finished, {} won", slot),
                    None => info!("Match finished in a draw"),
                }
                self.result = Some(result);
                self.transition(MatchPhase::Finished, &mut out);
            }
            MatchPhase::Finished if self.result.is_some() => {
                info!("Match result revised to {}-{}", result.player1.score, result.player2.score);
                self.result = Some(result);
            }
            _ => debug!("Ignoring match result in {:?}", self.phase),
        }
        self.publish(out)
    }

    /// The settle window closed; hand the result to the presenter.
    pub fn on_result_due(&mut self, now: Instant) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        match self.result_at {
            Some(at) if self.phase == MatchPhase::Finished && now >= at => {
                self.result_at = None;
                if let Some(result) = self.result.take() {
                    out.push(MatchEvent::PresentResult(result));
                }
            }
            _ => {}
        }
        self.publish(out)
    }

    /// The result presentation completed.
    pub fn on_result_presented(&mut self) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        if self.phase == MatchPhase::Finished {
            self.transition(MatchPhase::Lobby, &mut out);
            self.role = None;
            out.push(MatchEvent::TeardownSession);
        }
        self.publish(out)
    }

    /// Return to Lobby from wherever the machine is, e.g. after a failed start.
    pub fn reset(&mut self, notice: Option<&str>) -> Vec<MatchEvent> {
        let mut out = Vec::new();
        self.respawn_at = None;
        self.result_at = None;
        self.result = None;
        self.role = None;
        if let Some(text) = notice {
            out.push(MatchEvent::Notice(text.to_string()));
        }
        self.transition(MatchPhase::Lobby, &mut out);
        self.publish(out)
    }

    fn abandon(&mut self, notice: Option<&str>, out: &mut Vec<MatchEvent>) {
        if matches!(self.phase, MatchPhase::Lobby | MatchPhase::Finished) {
            return;
        }
        self.respawn_at = None;
        self.role = None;
        if let Some(text) = notice {
            out.push(MatchEvent::Notice(text.to_string()));
        }
        self.transition(MatchPhase::Lobby, out);
    }

    fn transition(&mut self, to: MatchPhase, out: &mut Vec<MatchEvent>) {
        let from = self.phase;
        if from == to {
            return;
        }
        let was_enabled = self.input_enabled();
        self.phase = to;
        debug!("Match {:?} -> {:?}", from, to);
        out.push(MatchEvent::PhaseChanged { from, to });
        if was_enabled != self.input_enabled() {
            out.push(MatchEvent::InputEnabled(self.input_enabled()));
        }
    }

    fn publish(&self, out: Vec<MatchEvent>) -> Vec<MatchEvent> {
        for event in &out {
            let _ = self.event_tx.send(event.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::map::MapLayout;
    use crate::replication::scoreboard::{MatchConfig, MatchMode};

    const DELAY: Duration = Duration::from_secs(2);

    fn view(winner: Option<PlayerSlot>, player1: u32, player2: u32) -> MatchResultView {
        let entry = |name: &str, score| ResultEntry { name: name.into(), color: None, score };
        MatchResultView {
            winner,
            local_slot: PlayerSlot::Player1,
            player1: entry("alice", player1),
            player2: entry("bob", player2),
        }
    }

    fn configured() -> ReplicationEvent {
        ReplicationEvent::MatchConfigured {
            config: MatchConfig::new(MatchMode::Bo3),
            layout: MapLayout { seed: 0, obstacles: vec![] },
        }
    }

    fn active(role: Role) -> MatchStateMachine {
        let mut machine = MatchStateMachine::new(DELAY);
        machine.begin_negotiation(role);
        machine.on_session_event(&SessionEvent::Connected);
        let ready = match role {
            Role::Initiator => ReplicationEvent::RemoteReady,
            Role::Responder => configured(),
        };
        machine.on_replication_event(&ready, Instant::now());
        assert_eq!(machine.phase(), MatchPhase::Active);
        machine
    }

    #[tokio::test]
    async fn test_handshake_enables_input() {
        let mut machine = MatchStateMachine::new(DELAY);
        assert!(!machine.input_enabled());
        machine.begin_negotiation(Role::Initiator);
        assert_eq!(machine.phase(), MatchPhase::Negotiating);

        let events = machine.on_session_event(&SessionEvent::Connected);
        assert_eq!(events, vec![MatchEvent::PhaseChanged {
            from: MatchPhase::Negotiating,
            to: MatchPhase::AwaitingReady,
        }]);

        let events = machine.on_replication_event(&ReplicationEvent::RemoteReady, Instant::now());
        assert!(events.contains(&MatchEvent::InputEnabled(true)));
        assert!(machine.input_enabled());
    }

    #[tokio::test]
    async fn test_initiator_ignores_own_configuration() {
        let mut machine = MatchStateMachine::new(DELAY);
        machine.begin_negotiation(Role::Initiator);
        machine.on_session_event(&SessionEvent::Connected);
        let configured = configured();
        assert!(machine.on_replication_event(&configured, Instant::now()).is_empty());
        assert_eq!(machine.phase(), MatchPhase::AwaitingReady);
    }

    #[tokio::test(start_paused = true)]
    async fn test_death_then_respawn_after_delay() {
        let mut machine = active(Role::Responder);
        let t0 = Instant::now();

        let events = machine.on_replication_event(&ReplicationEvent::LocalDied, t0);
        assert!(events.contains(&MatchEvent::InputEnabled(false)));
        assert_eq!(machine.phase(), MatchPhase::RoundTransition);
        assert_eq!(machine.respawn_deadline(), Some(t0 + DELAY));

        assert!(machine.on_respawn_due(t0 + Duration::from_millis(1999)).is_empty());
        let events = machine.on_respawn_due(t0 + DELAY);
        assert_eq!(events[0], MatchEvent::RespawnLocal);
        assert!(events.contains(&MatchEvent::InputEnabled(true)));
        assert_eq!(machine.phase(), MatchPhase::Active);
        assert_eq!(machine.respawn_deadline(), None);
    }

    #[tokio::test]
    async fn test_finish_cancels_respawn_and_returns_to_lobby() {
        let mut machine = active(Role::Initiator);
        machine.on_replication_event(&ReplicationEvent::LocalDied, Instant::now());

        let now = Instant::now();
        let events = machine.finish(view(Some(PlayerSlot::Player2), 1, 2), now);
        assert_eq!(machine.phase(), MatchPhase::Finished);
        assert!(events.contains(&MatchEvent::PhaseChanged {
            from: MatchPhase::RoundTransition,
            to: MatchPhase::Finished,
        }));
        assert_eq!(machine.respawn_deadline(), None);

        // Respawn never fires once finished
        assert!(machine.on_respawn_due(now + DELAY * 2).is_empty());

        let events = machine.on_result_due(now);
        assert!(matches!(events.as_slice(), [MatchEvent::PresentResult(v)] if !v.local_won()));
        assert_eq!(machine.result_deadline(), None);

        let events = machine.on_result_presented();
        assert!(events.contains(&MatchEvent::TeardownSession));
        assert_eq!(machine.phase(), MatchPhase::Lobby);
    }

    #[tokio::test]
    async fn test_disconnect_mid_round_returns_to_lobby() {
        let mut machine = active(Role::Initiator);
        let events = machine.on_session_event(&SessionEvent::Disconnected);
        assert!(events.contains(&MatchEvent::Notice("Opponent disconnected".into())));
        assert!(events.contains(&MatchEvent::InputEnabled(false)));
        assert_eq!(machine.phase(), MatchPhase::Lobby);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_revised_while_settling() {
        let settle = Duration::from_secs(1);
        let mut machine = active(Role::Initiator).with_result_settle(settle);
        let t0 = Instant::now();

        machine.finish(view(Some(PlayerSlot::Player2), 1, 2), t0);
        assert_eq!(machine.result_deadline(), Some(t0 + settle));
        assert!(machine.on_result_due(t0 + Duration::from_millis(999)).is_empty());

        // The crossing death levels the score before the window closes
        assert!(machine.finish(view(None, 2, 2), t0 + Duration::from_millis(200)).is_empty());
        let events = machine.on_result_due(t0 + settle);
        match events.as_slice() {
            [MatchEvent::PresentResult(v)] => {
                assert!(v.is_draw());
                assert_eq!(v.player1.score, 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Too late to revise once presented
        assert!(machine.finish(view(Some(PlayerSlot::Player1), 3, 2), t0 + settle).is_empty());
        assert!(machine.on_result_due(t0 + settle * 2).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_during_result_is_ignored() {
        let mut machine = active(Role::Initiator);
        machine.finish(view(Some(PlayerSlot::Player1), 2, 0), Instant::now());
        assert!(machine.on_session_event(&SessionEvent::Disconnected).is_empty());
        assert_eq!(machine.phase(), MatchPhase::Finished);
    }

    #[tokio::test]
    async fn test_timeout_while_negotiating() {
        let mut machine = MatchStateMachine::new(DELAY);
        machine.begin_negotiation(Role::Responder);
        machine.on_session_event(&SessionEvent::TimedOut);
        assert_eq!(machine.phase(), MatchPhase::Lobby);
        assert_eq!(machine.role(), None);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let mut machine = MatchStateMachine::new(DELAY);
        let mut rx = machine.subscribe_events();
        machine.begin_negotiation(Role::Initiator);
        assert_eq!(
            rx.try_recv().unwrap(),
            MatchEvent::PhaseChanged { from: MatchPhase::Lobby, to: MatchPhase::Negotiating }
        );
    }
}
