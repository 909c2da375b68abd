//! Match Controller
//!
//! The single task that owns one peer's session, channel protocol,
//! replication coordinator and match state machine. Everything that can
//! happen is funneled through it: user commands, transport events, the
//! replication tick and the two deadlines (connect and respawn).
//!
//! The direct async methods are the same operations the run loop performs,
//! so they can be driven step by step without spawning anything.
//!
//! The result presentation runs on its own task so commands and transport
//! events keep flowing while it plays; the presenter comes back when it ends.

use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::DuelConfig;
use crate::core::Vec3;
use crate::protocol::channel::ChannelProtocol;
use crate::protocol::envelope::Message;
use crate::replication::coordinator::{ReplicationCoordinator, ReplicationEvent, ReplicationUpdate};
use crate::replication::map::MapLayout;
use crate::replication::player::{PlayerProfile, PlayerSlot, TankPose};
use crate::replication::scoreboard::MatchMode;
use crate::session::negotiator::{
    NegotiationError, NegotiatorState, Role, SessionEvent, SessionNegotiator,
};
use crate::session::relay::resolve_ice_servers;
use crate::session::transport::{TransportEvent, TransportFactory};
use crate::signaling::SignalingBlob;
use super::cutscene::ResultPresenter;
use super::machine::{MatchEvent, MatchPhase, MatchResultView, MatchStateMachine, ResultEntry};

/// Controller errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A session is already being negotiated or is connected.
    #[error("a session is already active")]
    SessionActive,

    /// No session to act on.
    #[error("no session in progress")]
    NoSession,

    /// Negotiation failed.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// The controller task is gone.
    #[error("controller stopped")]
    Stopped,
}

/// Requests to the controller task.
#[derive(Debug, Clone)]
pub enum ControllerCommand {
    /// Start a session as the initiator.
    Host {
        /// Match mode to propose.
        mode: MatchMode,
    },
    /// Start a session as the responder.
    Join,
    /// The blob pasted by the user.
    AcceptRemote(String),
    /// Abandon the session.
    Cancel,
    /// Latest local tank pose.
    UpdatePose(TankPose),
    /// The local tank fired.
    Fire {
        /// Muzzle position.
        position: Vec3,
        /// Shot direction.
        direction: Vec3,
    },
    /// A locally detected hit.
    Hit {
        /// Tank that was hit.
        target: PlayerSlot,
        /// Damage dealt.
        damage: u32,
    },
    /// A locally destroyed obstacle.
    ObstacleDestroyed(String),
    /// Ask the peer for its view of the match.
    RequestSync,
    /// Cancel and stop the task.
    Shutdown,
}

/// Everything the view layer needs to hear about.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Session lifecycle.
    Session(SessionEvent),
    /// Match sequencing.
    Match(MatchEvent),
    /// Replicated state changes.
    Replication(ReplicationEvent),
    /// A command failed.
    Error(String),
}

/// Units of follow-up work produced while handling one input.
enum Work {
    Update(ReplicationUpdate),
    Match(MatchEvent),
}

type Presentation = JoinHandle<Box<dyn ResultPresenter>>;

/// Owns one peer's side of a duel.
pub struct MatchController {
    config: DuelConfig,
    profile: PlayerProfile,
    factory: Arc<dyn TransportFactory>,
    presenter: Option<Box<dyn ResultPresenter>>,
    presentation: Option<Presentation>,
    http: reqwest::Client,
    map_seed: Option<u64>,
    machine: MatchStateMachine,
    negotiator: Option<SessionNegotiator>,
    protocol: Option<ChannelProtocol>,
    coordinator: Option<ReplicationCoordinator>,
    pending_mode: Option<MatchMode>,
    early_frames: VecDeque<String>,
    event_tx: broadcast::Sender<ControllerEvent>,
}

impl MatchController {
    /// Create a controller in Lobby.
    pub fn new(
        config: DuelConfig,
        profile: PlayerProfile,
        factory: Arc<dyn TransportFactory>,
        presenter: Box<dyn ResultPresenter>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let machine = MatchStateMachine::new(config.respawn_delay)
            .with_result_settle(config.result_settle);
        Self {
            config,
            profile,
            factory,
            presenter: Some(presenter),
            presentation: None,
            http: reqwest::Client::new(),
            map_seed: None,
            machine,
            negotiator: None,
            protocol: None,
            coordinator: None,
            pending_mode: None,
            early_frames: VecDeque::new(),
            event_tx,
        }
    }

    /// Generate hosted arenas from a fixed seed instead of a random one.
    pub fn with_map_seed(mut self, seed: u64) -> Self {
        self.map_seed = Some(seed);
        self
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Current match phase.
    pub fn phase(&self) -> MatchPhase {
        self.machine.phase()
    }

    /// Current session state, if a session was ever started.
    pub fn session_state(&self) -> Option<NegotiatorState> {
        self.negotiator.as_ref().map(|n| n.state())
    }

    /// Replicated match state, while connected.
    pub fn coordinator(&self) -> Option<&ReplicationCoordinator> {
        self.coordinator.as_ref()
    }

    /// Pose updates are flowing.
    pub fn is_replicating(&self) -> bool {
        matches!(self.machine.phase(), MatchPhase::Active | MatchPhase::RoundTransition)
            && self.protocol.is_some()
            && self.negotiator.as_ref().is_some_and(|n| n.is_connected())
    }

    /// Remote tank position to render now.
    pub fn remote_position(&self) -> Option<Vec3> {
        let coordinator = self.coordinator.as_ref()?;
        Some(coordinator.remote_position(Instant::now(), self.config.tick_interval()))
    }

    /// The result presentation is playing.
    pub fn is_presenting(&self) -> bool {
        self.presentation.is_some()
    }

    /// Subscribe to controller events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    fn publish(&self, event: ControllerEvent) {
        let _ = self.event_tx.send(event);
    }

    // =========================================================================
    // SESSION COMMANDS
    // =========================================================================

    /// Host a match: start as initiator and return the offer blob to share.
    #[instrument(skip(self))]
    pub async fn host(&mut self, mode: MatchMode) -> Result<SignalingBlob, ControllerError> {
        self.ensure_no_session()?;
        let mut negotiator = self.fresh_negotiator().await;
        let events = self.machine.begin_negotiation(Role::Initiator);
        self.drain(events.into_iter().map(Work::Match).collect()).await;

        match negotiator.start_as_initiator().await {
            Ok(blob) => {
                info!("Hosting {} match as {}", mode, self.profile.username);
                self.negotiator = Some(negotiator);
                self.pending_mode = Some(mode);
                self.publish(ControllerEvent::Session(SessionEvent::LocalDescriptionReady(blob.clone())));
                Ok(blob)
            }
            Err(e @ NegotiationError::TimedOut(_)) => {
                self.on_session_event(SessionEvent::TimedOut).await;
                Err(e.into())
            }
            Err(e) => {
                let events = self.machine.reset(Some(&format!("Could not start session: {e}")));
                self.drain(events.into_iter().map(Work::Match).collect()).await;
                Err(e.into())
            }
        }
    }

    /// Join a match: wait for the host's offer.
    pub async fn join(&mut self) -> Result<(), ControllerError> {
        self.ensure_no_session()?;
        let mut negotiator = self.fresh_negotiator().await;
        negotiator.start_as_responder()?;
        info!("Joining as {}", self.profile.username);
        self.negotiator = Some(negotiator);
        let events = self.machine.begin_negotiation(Role::Responder);
        self.drain(events.into_iter().map(Work::Match).collect()).await;
        Ok(())
    }

    /// Accept the peer's pasted blob. Returns the answer blob when joining.
    #[instrument(skip(self, text))]
    pub async fn accept_remote(&mut self, text: &str) -> Result<Option<SignalingBlob>, ControllerError> {
        let negotiator = self.negotiator.as_mut().ok_or(ControllerError::NoSession)?;
        match negotiator.accept_remote_description(text).await {
            Ok(Some(answer)) => {
                self.publish(ControllerEvent::Session(SessionEvent::LocalDescriptionReady(answer.clone())));
                Ok(Some(answer))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                match &e {
                    NegotiationError::Transport(reason) => {
                        self.on_session_event(SessionEvent::SetupFailed(reason.to_string())).await;
                    }
                    NegotiationError::TimedOut(_) => self.on_session_event(SessionEvent::TimedOut).await,
                    _ => {}
                }
                Err(e.into())
            }
        }
    }

    /// Abandon the session. Repeated calls are no-ops.
    pub async fn cancel(&mut self) {
        let Some(negotiator) = self.negotiator.as_mut() else { return };
        if let Some(event) = negotiator.cancel().await {
            self.on_session_event(event).await;
        }
    }

    fn ensure_no_session(&self) -> Result<(), ControllerError> {
        if self.negotiator.as_ref().is_some_and(|n| n.state().is_live())
            || self.machine.phase() != MatchPhase::Lobby
        {
            return Err(ControllerError::SessionActive);
        }
        Ok(())
    }

    async fn fresh_negotiator(&mut self) -> SessionNegotiator {
        new_negotiator(&self.http, &self.config, self.factory.clone()).await
    }

    // =========================================================================
    // GAMEPLAY COMMANDS
    // =========================================================================

    /// Record the latest local pose.
    pub fn update_pose(&mut self, pose: TankPose) {
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.set_local_pose(pose);
        }
    }

    /// Fire a shot. Returns false if input is disabled or the shot was not sent.
    pub async fn fire(&mut self, position: Vec3, direction: Vec3) -> bool {
        if !self.machine.input_enabled() {
            return false;
        }
        let Some(shot) = self.coordinator.as_ref().and_then(|c| c.fire(position, direction)) else {
            return false;
        };
        self.send(&shot).await
    }

    /// Report a locally detected hit.
    pub async fn report_hit(&mut self, target: PlayerSlot, damage: u32) {
        if let Some(update) = self.coordinator.as_mut().map(|c| c.report_hit(target, damage)) {
            self.drain(vec![Work::Update(update)]).await;
        }
    }

    /// Report a locally destroyed obstacle.
    pub async fn report_obstacle_destroyed(&mut self, id: &str) {
        if let Some(update) = self.coordinator.as_mut().map(|c| c.report_obstacle_destroyed(id)) {
            self.drain(vec![Work::Update(update)]).await;
        }
    }

    /// Ask the peer for its view of scores and obstacles.
    pub async fn request_sync(&mut self) {
        if let Some(request) = self.coordinator.as_ref().map(|c| c.sync_request()) {
            self.send(&request).await;
        }
    }

    // =========================================================================
    // EVENT HANDLING
    // =========================================================================

    /// Fold one transport event.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match &event {
            TransportEvent::Frame(raw) => {
                self.on_frame(raw.clone()).await;
                return;
            }
            TransportEvent::ChannelError(reason) => {
                if let Some(protocol) = self.protocol.as_mut() {
                    protocol.on_error(reason);
                }
            }
            TransportEvent::ChannelClosed => {
                if let Some(protocol) = self.protocol.as_mut() {
                    protocol.on_close();
                }
            }
            _ => {}
        }

        let Some(negotiator) = self.negotiator.as_mut() else { return };
        if let Some(session_event) = negotiator.handle_transport_event(&event).await {
            self.on_session_event(session_event).await;
        }
    }

    /// Handle every transport event already queued. Returns how many there were.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let Some(event) = self.negotiator.as_mut().and_then(|n| n.try_next_transport_event()) else {
                break;
            };
            self.handle_transport_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Send the local pose, if replicating.
    pub async fn replication_tick(&mut self) {
        if !self.is_replicating() {
            return;
        }
        if let Some(update) = self.coordinator.as_ref().map(|c| c.state_update()) {
            self.send(&update).await;
        }
    }

    /// The connect deadline passed.
    pub async fn on_connect_deadline(&mut self) {
        let Some(negotiator) = self.negotiator.as_mut() else { return };
        if let Some(event) = negotiator.on_connect_timeout(Instant::now()).await {
            self.on_session_event(event).await;
        }
    }

    /// The respawn deadline passed.
    pub async fn on_respawn_due(&mut self) {
        let events = self.machine.on_respawn_due(Instant::now());
        self.drain(events.into_iter().map(Work::Match).collect()).await;
    }

    /// The result settle window closed; start the presentation.
    pub async fn on_result_due(&mut self) {
        let events = self.machine.on_result_due(Instant::now());
        self.drain(events.into_iter().map(Work::Match).collect()).await;
    }

    /// Wait for a running presentation to end, then return to Lobby.
    pub async fn finish_presentation(&mut self) {
        let Some(task) = self.presentation.take() else { return };
        let finished = task.await;
        self.on_presentation_finished(finished).await;
    }

    async fn on_presentation_finished(&mut self, finished: Result<Box<dyn ResultPresenter>, JoinError>) {
        match finished {
            Ok(presenter) => self.presenter = Some(presenter),
            Err(e) => warn!("Result presentation ended abnormally: {}", e),
        }
        let events = self.machine.on_result_presented();
        self.drain(events.into_iter().map(Work::Match).collect()).await;
    }

    /// Hand the result to the presenter task. Without a presenter the
    /// presentation is skipped.
    fn start_presentation(&mut self, view: MatchResultView) -> Vec<MatchEvent> {
        let Some(mut presenter) = self.presenter.take() else {
            warn!("No result presenter available, skipping presentation");
            return self.machine.on_result_presented();
        };
        self.presentation = Some(tokio::spawn(async move {
            presenter.present(&view).await;
            presenter
        }));
        Vec::new()
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        self.publish(ControllerEvent::Session(event.clone()));
        let match_events = self.machine.on_session_event(&event);
        self.drain(match_events.into_iter().map(Work::Match).collect()).await;

        match event {
            SessionEvent::Connected => self.begin_replication().await,
            SessionEvent::TimedOut
            | SessionEvent::Failed(_)
            | SessionEvent::Disconnected
            | SessionEvent::Cancelled => {
                self.protocol = None;
                self.coordinator = None;
                self.pending_mode = None;
                self.early_frames.clear();
            }
            _ => {}
        }
    }

    async fn begin_replication(&mut self) {
        let Some(negotiator) = self.negotiator.as_ref() else { return };
        let (Some(channel), Some(role)) = (negotiator.channel(), negotiator.role()) else {
            warn!("Connected without a data channel");
            return;
        };

        let mut protocol = ChannelProtocol::new(channel);
        protocol.on_open();
        self.protocol = Some(protocol);

        let mut coordinator = ReplicationCoordinator::new(role, self.profile.clone());
        let mut opening = ReplicationUpdate::default();
        if role == Role::Initiator {
            let mode = self.pending_mode.take().unwrap_or(MatchMode::Bo3);
            let layout = match self.map_seed {
                Some(seed) => MapLayout::generate(seed, &self.config.map),
                None => MapLayout::random(&self.config.map),
            };
            match coordinator.host_match(mode, layout) {
                Ok(update) => opening = update,
                Err(e) => warn!("Could not configure match: {}", e),
            }
        }
        if let Some(intro) = coordinator.introduce() {
            opening.outbound.push(intro);
        }
        self.coordinator = Some(coordinator);

        let mut work = vec![Work::Update(opening)];
        while let Some(raw) = self.early_frames.pop_front() {
            if let Some(update) = self.decode_and_apply(&raw) {
                work.push(Work::Update(update));
            }
        }
        self.drain(work).await;
    }

    async fn on_frame(&mut self, raw: String) {
        if self.protocol.is_none() {
            // Frames can beat the connected notification; replay them after.
            if self.negotiator.as_ref().is_some_and(|n| n.state().is_live()) {
                self.early_frames.push_back(raw);
            }
            return;
        }
        if let Some(update) = self.decode_and_apply(&raw) {
            self.drain(vec![Work::Update(update)]).await;
        }
    }

    fn decode_and_apply(&mut self, raw: &str) -> Option<ReplicationUpdate> {
        let received = self.protocol.as_mut()?.on_frame(raw)?;
        let coordinator = self.coordinator.as_mut()?;
        Some(coordinator.apply(received.message, received.timestamp, Instant::now()))
    }

    /// Work through replication updates and match events until nothing is
    /// left. Follow-ups are queued rather than recursed into.
    async fn drain(&mut self, initial: Vec<Work>) {
        let mut queue: VecDeque<Work> = initial.into();

        while let Some(work) = queue.pop_front() {
            match work {
                Work::Update(update) => {
                    for message in &update.outbound {
                        self.send(message).await;
                    }
                    for event in update.events {
                        self.publish(ControllerEvent::Replication(event.clone()));
                        let match_events = match &event {
                            ReplicationEvent::MatchOver { winner, .. } => match self.result_view(*winner) {
                                Some(view) => self.machine.finish(view, Instant::now()),
                                None => Vec::new(),
                            },
                            _ => self.machine.on_replication_event(&event, Instant::now()),
                        };
                        queue.extend(match_events.into_iter().map(Work::Match));
                    }
                }
                Work::Match(event) => {
                    self.publish(ControllerEvent::Match(event.clone()));
                    match event {
                        MatchEvent::RespawnLocal => {
                            if let Some(update) = self.coordinator.as_mut().map(|c| c.respawn_local()) {
                                queue.push_back(Work::Update(update));
                            }
                        }
                        MatchEvent::PresentResult(view) => {
                            let after = self.start_presentation(view);
                            queue.extend(after.into_iter().map(Work::Match));
                        }
                        MatchEvent::TeardownSession => self.teardown().await,
                        MatchEvent::Notice(text) => info!("{}", text),
                        MatchEvent::PhaseChanged { .. } | MatchEvent::InputEnabled(_) => {}
                    }
                }
            }
        }
    }

    fn result_view(&self, winner: Option<PlayerSlot>) -> Option<MatchResultView> {
        let coordinator = self.coordinator.as_ref()?;
        let entry = |slot: PlayerSlot| {
            let record = coordinator.player(slot);
            ResultEntry {
                name: record.display_name(),
                color: record.profile().map(|p| p.color),
                score: record.score(),
            }
        };
        Some(MatchResultView {
            winner,
            local_slot: coordinator.local().slot(),
            player1: entry(PlayerSlot::Player1),
            player2: entry(PlayerSlot::Player2),
        })
    }

    async fn send(&mut self, message: &Message) -> bool {
        match self.protocol.as_mut() {
            Some(protocol) => protocol.send(message).await,
            None => {
                debug!("No channel, dropping {}", message.kind());
                false
            }
        }
    }

    async fn teardown(&mut self) {
        info!("Tearing down session");
        if let Some(mut protocol) = self.protocol.take() {
            protocol.close().await;
        }
        self.coordinator = None;
        self.early_frames.clear();
        if let Some(negotiator) = self.negotiator.as_mut() {
            if let Some(event) = negotiator.cancel().await {
                self.publish(ControllerEvent::Session(event));
            }
        }
    }

    // =========================================================================
    // TASK
    // =========================================================================

    /// Apply one command. Returns false when the task should stop.
    pub async fn handle_command(&mut self, command: ControllerCommand) -> bool {
        let result = match command {
            ControllerCommand::Host { mode } => self.host(mode).await.map(|_| ()),
            ControllerCommand::Join => self.join().await,
            ControllerCommand::AcceptRemote(text) => self.accept_remote(&text).await.map(|_| ()),
            ControllerCommand::Cancel => {
                self.cancel().await;
                Ok(())
            }
            ControllerCommand::UpdatePose(pose) => {
                self.update_pose(pose);
                Ok(())
            }
            ControllerCommand::Fire { position, direction } => {
                self.fire(position, direction).await;
                Ok(())
            }
            ControllerCommand::Hit { target, damage } => {
                self.report_hit(target, damage).await;
                Ok(())
            }
            ControllerCommand::ObstacleDestroyed(id) => {
                self.report_obstacle_destroyed(&id).await;
                Ok(())
            }
            ControllerCommand::RequestSync => {
                self.request_sync().await;
                Ok(())
            }
            ControllerCommand::Shutdown => {
                self.cancel().await;
                return false;
            }
        };

        if let Err(e) = result {
            warn!("Command failed: {}", e);
            self.publish(ControllerEvent::Error(e.to_string()));
        }
        true
    }

    /// Run until shut down or every command sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ControllerCommand>) {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let replicating = self.is_replicating();
            let connect_deadline = self.negotiator.as_ref().and_then(|n| n.connect_deadline());
            let respawn_deadline = self.machine.respawn_deadline();
            let result_deadline = self.machine.result_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.cancel().await;
                        break;
                    }
                },
                Some(event) = next_transport_event(&mut self.negotiator) => {
                    self.handle_transport_event(event).await;
                }
                _ = ticker.tick(), if replicating => {
                    self.replication_tick().await;
                }
                _ = sleep_until_opt(connect_deadline) => {
                    self.on_connect_deadline().await;
                }
                _ = sleep_until_opt(respawn_deadline) => {
                    self.on_respawn_due().await;
                }
                _ = sleep_until_opt(result_deadline) => {
                    self.on_result_due().await;
                }
                finished = join_presentation(&mut self.presentation) => {
                    self.on_presentation_finished(finished).await;
                }
            }
        }

        if let Some(task) = self.presentation.take() {
            task.abort();
        }
        info!("Match controller stopped");
    }

    /// Spawn the run loop.
    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::channel(64);
        let handle = ControllerHandle { commands, events: self.event_tx.clone() };
        let join = tokio::spawn(self.run(command_rx));
        (handle, join)
    }
}

async fn new_negotiator(
    http: &reqwest::Client,
    config: &DuelConfig,
    factory: Arc<dyn TransportFactory>,
) -> SessionNegotiator {
    let ice_servers = resolve_ice_servers(
        http,
        config.relay_credentials_url.as_deref(),
        &config.stun_urls,
        config.relay_timeout,
    )
    .await;
    SessionNegotiator::new(config.negotiator_config(ice_servers), factory)
}

async fn next_transport_event(negotiator: &mut Option<SessionNegotiator>) -> Option<TransportEvent> {
    match negotiator {
        Some(negotiator) => negotiator.next_transport_event().await,
        None => std::future::pending().await,
    }
}

/// Resolves when the presentation task ends and clears the slot.
async fn join_presentation(task: &mut Option<Presentation>) -> Result<Box<dyn ResultPresenter>, JoinError> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let finished = handle.await;
    *task = None;
    finished
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Cloneable access to a spawned controller.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<ControllerCommand>,
    events: broadcast::Sender<ControllerEvent>,
}

impl ControllerHandle {
    /// Queue a command.
    pub async fn send(&self, command: ControllerCommand) -> Result<(), ControllerError> {
        self.commands.send(command).await.map_err(|_| ControllerError::Stopped)
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::game::cutscene::ScriptedCutscene;
    use crate::replication::player::MAX_HEALTH;
    use crate::replication::scoreboard::ScoreLine;
    use crate::session::memory::MemoryNetwork;

    fn controller_with(
        network: &MemoryNetwork,
        name: &str,
        color: &str,
        cutscene: ScriptedCutscene,
    ) -> MatchController {
        let config = DuelConfig {
            respawn_delay: Duration::ZERO,
            result_settle: Duration::ZERO,
            stun_urls: vec![],
            ..Default::default()
        };
        MatchController::new(
            config,
            PlayerProfile::new(name, color).unwrap(),
            Arc::new(network.factory()),
            Box::new(cutscene),
        )
        .with_map_seed(7)
    }

    fn controller(network: &MemoryNetwork, name: &str, color: &str) -> MatchController {
        controller_with(network, name, color, ScriptedCutscene::instant())
    }

    async fn settle(a: &mut MatchController, b: &mut MatchController) {
        while a.pump().await + b.pump().await > 0 {}
    }

    /// Present the settled result and wait for it to finish.
    async fn conclude(side: &mut MatchController) {
        side.on_result_due().await;
        side.finish_presentation().await;
    }

    fn presented(rx: &mut broadcast::Receiver<ControllerEvent>) -> Option<MatchResultView> {
        let mut result = None;
        while let Ok(event) = rx.try_recv() {
            if let ControllerEvent::Match(MatchEvent::PresentResult(view)) = event {
                result = Some(view);
            }
        }
        result
    }

    async fn connected(network: &MemoryNetwork) -> (MatchController, MatchController) {
        connected_with(network, ScriptedCutscene::instant).await
    }

    async fn connected_with(
        network: &MemoryNetwork,
        cutscene: fn() -> ScriptedCutscene,
    ) -> (MatchController, MatchController) {
        let mut host = controller_with(network, "alice", "red", cutscene());
        let mut guest = controller_with(network, "bob", "blue", cutscene());

        let offer = host.host(MatchMode::Bo3).await.unwrap();
        guest.join().await.unwrap();
        let answer = guest.accept_remote(&offer.encode().unwrap()).await.unwrap().unwrap();
        assert!(host.accept_remote(&answer.encode().unwrap()).await.unwrap().is_none());
        settle(&mut host, &mut guest).await;
        (host, guest)
    }

    #[tokio::test]
    async fn test_handshake_reaches_active_on_both_sides() {
        let network = MemoryNetwork::new();
        let (host, guest) = connected(&network).await;

        assert_eq!(host.phase(), MatchPhase::Active);
        assert_eq!(guest.phase(), MatchPhase::Active);
        assert!(host.is_replicating() && guest.is_replicating());

        let host_view = host.coordinator().unwrap();
        let guest_view = guest.coordinator().unwrap();
        assert_eq!(host_view.layout(), guest_view.layout());
        assert_eq!(guest_view.config().unwrap().mode(), MatchMode::Bo3);
        assert_eq!(host_view.remote().display_name(), "bob");
        assert_eq!(guest_view.remote().display_name(), "alice");
    }

    #[tokio::test]
    async fn test_hit_only_changes_targets_own_health() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest) = connected(&network).await;

        host.report_hit(PlayerSlot::Player2, 30).await;
        // The shooter never applies damage to its mirror
        assert_eq!(host.coordinator().unwrap().remote().health(), MAX_HEALTH);

        settle(&mut host, &mut guest).await;
        assert_eq!(guest.coordinator().unwrap().local().health(), MAX_HEALTH - 30);
        assert_eq!(host.coordinator().unwrap().remote().health(), MAX_HEALTH);
    }

    #[tokio::test]
    async fn test_best_of_three_runs_to_result_and_back_to_lobby() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest) = connected(&network).await;
        let mut host_events = host.subscribe_events();

        host.report_hit(PlayerSlot::Player2, MAX_HEALTH).await;
        settle(&mut host, &mut guest).await;
        assert_eq!(guest.phase(), MatchPhase::RoundTransition);
        assert_eq!(host.coordinator().unwrap().scores().player1, 1);

        guest.on_respawn_due().await;
        settle(&mut host, &mut guest).await;
        assert_eq!(guest.phase(), MatchPhase::Active);
        assert!(host.coordinator().unwrap().remote().is_alive());

        host.report_hit(PlayerSlot::Player2, MAX_HEALTH).await;
        settle(&mut host, &mut guest).await;
        assert_eq!(host.phase(), MatchPhase::Finished);
        assert_eq!(guest.phase(), MatchPhase::Finished);

        conclude(&mut host).await;
        conclude(&mut guest).await;
        settle(&mut host, &mut guest).await;
        assert_eq!(host.phase(), MatchPhase::Lobby);
        assert_eq!(guest.phase(), MatchPhase::Lobby);
        assert!(host.coordinator().is_none());

        let result = presented(&mut host_events).unwrap();
        assert_eq!(result.winner, Some(PlayerSlot::Player1));
        assert!(result.local_won());
        assert_eq!(result.player1.score, 2);
        assert_eq!(result.player2.name, "bob");
    }

    #[tokio::test]
    async fn test_crossed_deaths_at_match_point_present_same_result() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest) = connected(&network).await;
        let mut host_events = host.subscribe_events();
        let mut guest_events = guest.subscribe_events();

        // One round each
        host.report_hit(PlayerSlot::Player2, MAX_HEALTH).await;
        settle(&mut host, &mut guest).await;
        guest.on_respawn_due().await;
        guest.report_hit(PlayerSlot::Player1, MAX_HEALTH).await;
        settle(&mut host, &mut guest).await;
        host.on_respawn_due().await;
        settle(&mut host, &mut guest).await;

        // Both tanks are destroyed locally before either death is delivered
        host.report_hit(PlayerSlot::Player1, MAX_HEALTH).await;
        guest.report_hit(PlayerSlot::Player2, MAX_HEALTH).await;
        settle(&mut host, &mut guest).await;

        let level = ScoreLine { player1: 2, player2: 2 };
        assert_eq!(host.coordinator().unwrap().scores(), level);
        assert_eq!(guest.coordinator().unwrap().scores(), level);

        conclude(&mut host).await;
        conclude(&mut guest).await;
        let host_result = presented(&mut host_events).unwrap();
        let guest_result = presented(&mut guest_events).unwrap();
        assert!(host_result.is_draw() && guest_result.is_draw());
        assert_eq!(host_result.player1.score, guest_result.player1.score);
        assert_eq!(host_result.player2.score, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presentation_does_not_block_commands() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest) = connected_with(&network, ScriptedCutscene::default).await;
        host.report_hit(PlayerSlot::Player2, MAX_HEALTH).await;
        settle(&mut host, &mut guest).await;
        guest.on_respawn_due().await;
        host.report_hit(PlayerSlot::Player2, MAX_HEALTH).await;
        settle(&mut host, &mut guest).await;
        assert_eq!(host.phase(), MatchPhase::Finished);

        let (handle, task) = host.spawn();
        let mut events = handle.subscribe();
        loop {
            if let Ok(ControllerEvent::Match(MatchEvent::PresentResult(_))) = events.recv().await {
                break;
            }
        }

        // The cutscene runs for seconds; shutdown is handled at once
        let started = Instant::now();
        handle.send(ControllerCommand::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), task).await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_transport_returns_to_lobby() {
        let network = MemoryNetwork::new();
        network.stall_descriptions(true);
        let mut host = controller(&network, "alice", "red");

        let started = Instant::now();
        let err = host.host(MatchMode::Bo3).await.unwrap_err();
        assert!(matches!(err, ControllerError::Negotiation(NegotiationError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(31));
        assert_eq!(host.phase(), MatchPhase::Lobby);

        network.stall_descriptions(false);
        host.host(MatchMode::Bo3).await.unwrap();
        assert_eq!(host.phase(), MatchPhase::Negotiating);
    }

    #[tokio::test]
    async fn test_dropped_link_returns_both_to_lobby() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest) = connected(&network).await;

        network.sever_links();
        settle(&mut host, &mut guest).await;

        for side in [&host, &guest] {
            assert_eq!(side.session_state(), Some(NegotiatorState::Disconnected));
            assert_eq!(side.phase(), MatchPhase::Lobby);
            assert!(!side.is_replicating());
        }
    }

    #[tokio::test]
    async fn test_malformed_paste_keeps_state() {
        let network = MemoryNetwork::new();
        let mut guest = controller(&network, "bob", "blue");
        guest.join().await.unwrap();

        let err = guest.accept_remote("definitely not a blob").await.unwrap_err();
        assert!(matches!(err, ControllerError::Negotiation(NegotiationError::Signaling(_))));
        assert_eq!(guest.session_state(), Some(NegotiatorState::AwaitingRemote));
        assert_eq!(guest.phase(), MatchPhase::Negotiating);
    }

    #[tokio::test]
    async fn test_second_session_rejected() {
        let network = MemoryNetwork::new();
        let mut host = controller(&network, "alice", "red");
        host.host(MatchMode::Bo5).await.unwrap();
        assert!(matches!(host.host(MatchMode::Bo5).await, Err(ControllerError::SessionActive)));
        assert!(matches!(host.join().await, Err(ControllerError::SessionActive)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_offer_times_out() {
        let network = MemoryNetwork::new();
        let mut host = controller(&network, "alice", "red");
        host.host(MatchMode::Bo3).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        host.on_connect_deadline().await;

        assert_eq!(host.session_state(), Some(NegotiatorState::Failed));
        assert_eq!(host.phase(), MatchPhase::Lobby);
        // Lobby again: a new session may start
        host.host(MatchMode::Bo3).await.unwrap();
    }

    #[tokio::test]
    async fn test_fire_requires_input() {
        let network = MemoryNetwork::new();
        let (mut host, mut guest) = connected(&network).await;
        let mut guest_events = guest.subscribe_events();

        assert!(host.fire(Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 2.0)).await);
        settle(&mut host, &mut guest).await;
        assert!(std::iter::from_fn(|| guest_events.try_recv().ok()).any(|e| matches!(
            e,
            ControllerEvent::Replication(ReplicationEvent::RemoteShot(_))
        )));

        host.cancel().await;
        assert!(!host.fire(Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0)).await);
    }

    #[tokio::test]
    async fn test_spawned_controllers_connect() {
        let network = MemoryNetwork::new();
        let (host, host_task) = controller(&network, "alice", "red").spawn();
        let (guest, guest_task) = controller(&network, "bob", "blue").spawn();
        let mut host_events = host.subscribe();
        let mut guest_events = guest.subscribe();

        async fn next_blob(rx: &mut broadcast::Receiver<ControllerEvent>) -> SignalingBlob {
            loop {
                if let Ok(ControllerEvent::Session(SessionEvent::LocalDescriptionReady(blob))) = rx.recv().await {
                    return blob;
                }
            }
        }

        async fn until_active(rx: &mut broadcast::Receiver<ControllerEvent>) {
            loop {
                if let Ok(ControllerEvent::Match(MatchEvent::PhaseChanged { to: MatchPhase::Active, .. })) =
                    rx.recv().await
                {
                    return;
                }
            }
        }

        let exchange = async {
            host.send(ControllerCommand::Host { mode: MatchMode::Infinite }).await.unwrap();
            let offer = next_blob(&mut host_events).await;
            guest.send(ControllerCommand::Join).await.unwrap();
            guest.send(ControllerCommand::AcceptRemote(offer.encode().unwrap())).await.unwrap();
            let answer = next_blob(&mut guest_events).await;
            host.send(ControllerCommand::AcceptRemote(answer.encode().unwrap())).await.unwrap();
            until_active(&mut host_events).await;
            until_active(&mut guest_events).await;
        };
        tokio::time::timeout(Duration::from_secs(5), exchange).await.unwrap();

        host.send(ControllerCommand::Shutdown).await.unwrap();
        guest.send(ControllerCommand::Shutdown).await.unwrap();
        host_task.await.unwrap();
        guest_task.await.unwrap();
    }
}
