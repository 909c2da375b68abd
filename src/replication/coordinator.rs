//! Replication Coordinator
//!
//! Keeps both tanks' records and applies the authority rules:
//!
//! - A peer writes only its own tank's health. A locally detected hit on the
//!   opponent becomes a `damage` message; the opponent applies it.
//! - A peer declares only its own death. Receiving `death` awards the
//!   receiver a point; declaring one awards the opponent a point. Both peers
//!   therefore agree on the score without ever sending it as a command.
//! - The initiator alone generates the match configuration and arena; the
//!   responder applies whatever `game_start` carries.
//!
//! Every operation returns a [`ReplicationUpdate`]: messages to send and
//! events for the match state machine. The coordinator never touches the
//! network itself.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::vec3::Vec3;
use crate::protocol::envelope::{
    BulletSpawn, Damage, GameStart, Message, ObstacleDestroyed, PlayerInfo, PlayerUpdate,
    RoundEnd, SyncResponse,
};
use crate::session::negotiator::Role;
use super::map::{spawn_point, MapLayout, ObstacleField};
use super::player::{PlayerProfile, PlayerRecord, PlayerSlot, TankPose};
use super::scoreboard::{MatchConfig, MatchMode, ScoreLine};
use super::snapshot::RemoteSnapshot;

/// Replication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// Only the initiator configures the match.
    #[error("only the initiator can start a match")]
    NotInitiator,

    /// The match configuration is already fixed.
    #[error("match already configured")]
    AlreadyConfigured,
}

/// What replication observed, for the state machine and the view.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// Remote username and color arrived.
    RemoteProfile(PlayerProfile),
    /// The match configuration is fixed on this peer.
    MatchConfigured {
        /// Configuration.
        config: MatchConfig,
        /// Arena.
        layout: MapLayout,
    },
    /// The responder applied `game_start` (initiator side).
    RemoteReady,
    /// The opponent fired.
    RemoteShot(BulletSpawn),
    /// The local tank lost health.
    LocalDamaged {
        /// Damage applied.
        amount: u32,
        /// Health left.
        health: u32,
    },
    /// The local tank was destroyed; the opponent scored.
    LocalDied,
    /// The opponent reported its own death; the local player scored.
    RemoteDied,
    /// Scores changed.
    ScoreChanged(ScoreLine),
    /// A player reached the win threshold. Raised again if a death already
    /// in flight moves the final scores.
    MatchOver {
        /// Leading slot; `None` when the scores are level.
        winner: Option<PlayerSlot>,
        /// Final scores.
        scores: ScoreLine,
    },
    /// The local tank respawned.
    LocalRespawned {
        /// New round number.
        round: u32,
    },
    /// The opponent respawned.
    RemoteRespawned,
    /// An obstacle was removed.
    ObstacleRemoved(String),
    /// The peers disagree on the score.
    ScoreDivergence {
        /// Local view.
        local: ScoreLine,
        /// Remote view.
        remote: ScoreLine,
    },
}

/// Result of one replication operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationUpdate {
    /// Messages to send, in order.
    pub outbound: Vec<Message>,
    /// Events, in order.
    pub events: Vec<ReplicationEvent>,
}

impl ReplicationUpdate {
    /// Nothing happened.
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }

    fn send(&mut self, message: Message) {
        self.outbound.push(message);
    }

    fn emit(&mut self, event: ReplicationEvent) {
        self.events.push(event);
    }
}

/// Both tanks' records plus match-wide replicated state for one session.
pub struct ReplicationCoordinator {
    role: Role,
    local: PlayerRecord,
    remote: PlayerRecord,
    config: Option<MatchConfig>,
    layout: Option<MapLayout>,
    obstacles: ObstacleField,
    snapshot: Option<RemoteSnapshot>,
    round: u32,
    deaths_observed: u32,
    match_over: bool,
    event_tx: broadcast::Sender<ReplicationEvent>,
}

impl ReplicationCoordinator {
    /// New coordinator for a connected session.
    pub fn new(role: Role, profile: PlayerProfile) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let local_slot = slot_for(role);
        let mut local = PlayerRecord::new(local_slot, Some(profile));
        let (position, rotation) = spawn_point(local_slot);
        local.set_pose(TankPose { position, rotation, ..Default::default() });

        Self {
            role,
            local,
            remote: PlayerRecord::new(local_slot.opponent(), None),
            config: None,
            layout: None,
            obstacles: ObstacleField::default(),
            snapshot: None,
            round: 1,
            deaths_observed: 0,
            match_over: false,
            event_tx,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// This peer's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Local tank.
    pub fn local(&self) -> &PlayerRecord {
        &self.local
    }

    /// Remote tank mirror.
    pub fn remote(&self) -> &PlayerRecord {
        &self.remote
    }

    /// Record for a slot.
    pub fn player(&self, slot: PlayerSlot) -> &PlayerRecord {
        if slot == self.local.slot() {
            &self.local
        } else {
            &self.remote
        }
    }

    /// Current scores.
    pub fn scores(&self) -> ScoreLine {
        ScoreLine {
            player1: self.player(PlayerSlot::Player1).score(),
            player2: self.player(PlayerSlot::Player2).score(),
        }
    }

    /// Deaths seen by this peer, both sides.
    pub fn deaths_observed(&self) -> u32 {
        self.deaths_observed
    }

    /// Match configuration, once fixed.
    pub fn config(&self) -> Option<MatchConfig> {
        self.config
    }

    /// Arena layout, once fixed.
    pub fn layout(&self) -> Option<&MapLayout> {
        self.layout.as_ref()
    }

    /// Standing obstacles.
    pub fn obstacles(&self) -> &ObstacleField {
        &self.obstacles
    }

    /// Latest remote snapshot.
    pub fn snapshot(&self) -> Option<&RemoteSnapshot> {
        self.snapshot.as_ref()
    }

    /// Current round (starts at 1).
    pub fn round(&self) -> u32 {
        self.round
    }

    /// A player has reached the win threshold.
    pub fn is_match_over(&self) -> bool {
        self.match_over
    }

    /// Subscribe to replication events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.event_tx.subscribe()
    }

    fn in_play(&self) -> bool {
        self.config.is_some() && !self.match_over
    }

    fn finish(&self, update: ReplicationUpdate) -> ReplicationUpdate {
        for event in &update.events {
            let _ = self.event_tx.send(event.clone());
        }
        update
    }

    // =========================================================================
    // LOCAL OPERATIONS
    // =========================================================================

    /// `player_info` for the local profile.
    pub fn introduce(&self) -> Option<Message> {
        self.local.profile().map(|p| {
            Message::PlayerInfo(PlayerInfo { username: p.username.clone(), color: p.color })
        })
    }

    /// Fix the match configuration and arena (initiator only) and produce
    /// the `game_start` message.
    pub fn host_match(&mut self, mode: MatchMode, layout: MapLayout) -> Result<ReplicationUpdate, ReplicationError> {
        if self.role != Role::Initiator {
            return Err(ReplicationError::NotInitiator);
        }
        if self.config.is_some() {
            return Err(ReplicationError::AlreadyConfigured);
        }

        let config = MatchConfig::new(mode);
        info!("Hosting {} match on arena seed {}", mode, layout.seed);
        let mut update = ReplicationUpdate::default();
        update.send(Message::GameStart(GameStart { mode, map_data: layout.clone() }));
        update.emit(self.configure(config, layout));
        Ok(self.finish(update))
    }

    fn configure(&mut self, config: MatchConfig, layout: MapLayout) -> ReplicationEvent {
        self.config = Some(config);
        self.obstacles = ObstacleField::from_layout(&layout);
        self.layout = Some(layout.clone());
        ReplicationEvent::MatchConfigured { config, layout }
    }

    /// Latest local pose from the input layer.
    pub fn set_local_pose(&mut self, pose: TankPose) {
        self.local.set_pose(pose);
    }

    /// `player_update` for the current local pose.
    pub fn state_update(&self) -> Message {
        let pose = self.local.pose();
        Message::PlayerUpdate(PlayerUpdate {
            position: pose.position,
            rotation: pose.rotation,
            head_rotation: pose.head_rotation,
            turret_rotation: pose.turret_rotation,
            velocity: pose.velocity,
        })
    }

    /// `bullet_spawn` for a local shot, if the local tank can fire.
    pub fn fire(&self, position: Vec3, direction: Vec3) -> Option<Message> {
        if !self.in_play() || !self.local.is_alive() {
            return None;
        }
        Some(Message::BulletSpawn(BulletSpawn { position, direction: direction.normalize() }))
    }

    /// A locally detected hit. Damage to the local tank is applied here;
    /// damage to the opponent is only reported to it.
    pub fn report_hit(&mut self, target: PlayerSlot, amount: u32) -> ReplicationUpdate {
        let mut update = ReplicationUpdate::default();
        if !self.in_play() {
            return update;
        }
        if target == self.local.slot() {
            self.apply_local_damage(amount, &mut update);
        } else if self.remote.is_alive() {
            update.send(Message::Damage(Damage { damage: amount, target }));
        }
        self.finish(update)
    }

    /// A locally detected obstacle destruction. Broadcast once; repeats are
    /// no-ops.
    pub fn report_obstacle_destroyed(&mut self, id: &str) -> ReplicationUpdate {
        let mut update = ReplicationUpdate::default();
        if self.obstacles.remove(id) {
            update.send(Message::ObstacleDestroyed(ObstacleDestroyed { id: id.to_string() }));
            update.emit(ReplicationEvent::ObstacleRemoved(id.to_string()));
        }
        self.finish(update)
    }

    /// Respawn the local tank after a death and close the round.
    pub fn respawn_local(&mut self) -> ReplicationUpdate {
        let mut update = ReplicationUpdate::default();
        if self.local.is_alive() || self.match_over {
            return update;
        }

        self.local.restore();
        let (position, rotation) = spawn_point(self.local.slot());
        self.local.set_pose(TankPose { position, rotation, ..Default::default() });
        self.round += 1;

        let scores = self.scores();
        update.send(Message::RoundEnd(RoundEnd {
            round: self.round,
            player1_score: scores.player1,
            player2_score: scores.player2,
        }));
        update.emit(ReplicationEvent::LocalRespawned { round: self.round });
        self.finish(update)
    }

    /// `sync_request`.
    pub fn sync_request(&self) -> Message {
        Message::SyncRequest
    }

    fn apply_local_damage(&mut self, amount: u32, update: &mut ReplicationUpdate) {
        if !self.local.is_alive() {
            return;
        }
        let died = self.local.take_damage(amount);
        update.emit(ReplicationEvent::LocalDamaged { amount, health: self.local.health() });

        if died {
            info!("Local tank destroyed");
            update.send(Message::Death);
            self.remote.award_point();
            self.deaths_observed += 1;
            update.emit(ReplicationEvent::LocalDied);
            self.after_score(update);
        }
    }

    fn after_score(&mut self, update: &mut ReplicationUpdate) {
        let scores = self.scores();
        update.emit(ReplicationEvent::ScoreChanged(scores));

        let Some(config) = self.config else { return };
        if !config.win_threshold().is_reached(scores.highest()) {
            return;
        }
        self.match_over = true;
        let winner = scores.leader();
        match winner {
            Some(slot) => info!("{} wins {}", slot, scores),
            None => info!("Match drawn {}", scores),
        }
        update.emit(ReplicationEvent::MatchOver { winner, scores });
    }

    fn compare_scores(&self, remote: ScoreLine, update: &mut ReplicationUpdate) {
        let local = self.scores();
        if local != remote {
            warn!("Score divergence: local {} remote {}", local, remote);
            update.emit(ReplicationEvent::ScoreDivergence { local, remote });
        }
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Apply one message from the remote peer.
    pub fn apply(&mut self, message: Message, sent_at: i64, now: Instant) -> ReplicationUpdate {
        let mut update = ReplicationUpdate::default();

        match message {
            Message::PlayerInfo(info) => {
                let profile = PlayerProfile { username: info.username, color: info.color };
                self.remote.set_profile(profile.clone());
                update.emit(ReplicationEvent::RemoteProfile(profile));
            }
            Message::GameStart(start) => {
                if self.role == Role::Initiator {
                    warn!("Ignoring game_start from responder");
                } else if self.config.is_some() {
                    debug!("Ignoring repeated game_start");
                } else {
                    update.emit(self.configure(MatchConfig::new(start.mode), start.map_data));
                    update.send(Message::Ready);
                }
            }
            Message::Ready => {
                if self.role == Role::Initiator {
                    update.emit(ReplicationEvent::RemoteReady);
                }
            }
            Message::PlayerUpdate(state) => {
                let snapshot = RemoteSnapshot::from_update(&state, sent_at, now);
                self.remote.set_pose(TankPose {
                    position: state.position,
                    rotation: state.rotation,
                    head_rotation: state.head_rotation,
                    turret_rotation: state.turret_rotation,
                    velocity: state.velocity,
                });
                self.snapshot = Some(snapshot);
            }
            Message::BulletSpawn(shot) => {
                update.emit(ReplicationEvent::RemoteShot(shot));
            }
            Message::Damage(hit) => {
                if hit.target != self.local.slot() {
                    debug!("Ignoring damage addressed to {}", hit.target);
                } else if self.in_play() {
                    self.apply_local_damage(hit.damage, &mut update);
                }
            }
            Message::Death => {
                // Counted after the match ended too, so deaths that crossed
                // on the wire score on both peers
                if self.config.is_some() && self.remote.is_alive() {
                    self.remote.mark_dead();
                    self.local.award_point();
                    self.deaths_observed += 1;
                    update.emit(ReplicationEvent::RemoteDied);
                    self.after_score(&mut update);
                }
            }
            Message::RoundEnd(end) => {
                if !self.remote.is_alive() {
                    self.remote.restore();
                    let (position, rotation) = spawn_point(self.remote.slot());
                    self.remote.set_pose(TankPose { position, rotation, ..Default::default() });
                    update.emit(ReplicationEvent::RemoteRespawned);
                }
                self.round = self.round.max(end.round);
                self.compare_scores(
                    ScoreLine { player1: end.player1_score, player2: end.player2_score },
                    &mut update,
                );
            }
            Message::ObstacleDestroyed(destroyed) => {
                if self.obstacles.remove(&destroyed.id) {
                    update.emit(ReplicationEvent::ObstacleRemoved(destroyed.id));
                }
            }
            Message::SyncRequest => {
                let scores = self.scores();
                update.send(Message::SyncResponse(SyncResponse {
                    round: self.round,
                    player1_score: scores.player1,
                    player2_score: scores.player2,
                    destroyed: self.obstacles.destroyed_ids(),
                }));
            }
            Message::SyncResponse(sync) => {
                for id in sync.destroyed {
                    if self.obstacles.remove(&id) {
                        update.emit(ReplicationEvent::ObstacleRemoved(id));
                    }
                }
                self.compare_scores(
                    ScoreLine { player1: sync.player1_score, player2: sync.player2_score },
                    &mut update,
                );
            }
        }

        self.finish(update)
    }

    /// Dead-reckoned remote position, capped at one replication interval.
    pub fn remote_position(&self, now: Instant, interval: Duration) -> Vec3 {
        match &self.snapshot {
            Some(snapshot) => snapshot.extrapolate(now, interval),
            None => self.remote.pose().position,
        }
    }
}

/// Slot owned by a role.
pub fn slot_for(role: Role) -> PlayerSlot {
    match role {
        Role::Initiator => PlayerSlot::Player1,
        Role::Responder => PlayerSlot::Player2,
    }
}
