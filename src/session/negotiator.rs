//! Session Negotiation
//!
//! Drives one peer connection from nothing to a connected, open data channel
//! using a manually exchanged offer/answer pair.
//!
//! ```text
//! Initiator: Idle -> Negotiating -> GatheringCandidates -> AwaitingRemote -> Connected
//! Responder: Idle -> AwaitingRemote -> Negotiating -> GatheringCandidates -> AwaitingRemote -> Connected
//!
//! Any live state -> Failed | Cancelled | Disconnected (terminal)
//! ```
//!
//! `Connected` requires both the transport reporting connected and the data
//! channel reporting open. Every transport call made while setting up is
//! bounded by the connect deadline; a step that overruns it fails the session
//! with [`SessionEvent::TimedOut`]. All state changes happen on the owning task; the
//! transport only feeds events into a queue drained by [`SessionNegotiator::next_transport_event`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn, instrument};
use uuid::Uuid;

use crate::signaling::{SignalingBlob, SignalingError, SignalingKind};
use super::relay::IceServerConfig;
use super::transport::{
    DataChannel, PeerConnectionState, PeerTransport, TransportError, TransportEvent,
    TransportEventReceiver, TransportFactory,
};

/// Which side of the manual exchange this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the offer and the data channel; owns `player1`.
    Initiator,
    /// Answers the offer; owns `player2`.
    Responder,
}

/// Negotiator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    /// No session.
    Idle,
    /// Building the transport and local description.
    Negotiating,
    /// Waiting for candidate gathering to finish (bounded).
    GatheringCandidates,
    /// Waiting on the remote side: its blob, or connectivity.
    AwaitingRemote,
    /// Transport connected and channel open.
    Connected,
    /// Negotiation or connectivity failed.
    Failed,
    /// Torn down by the user.
    Cancelled,
    /// A connected session dropped.
    Disconnected,
}

impl NegotiatorState {
    /// Failed, Cancelled or Disconnected.
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiatorState::Failed | NegotiatorState::Cancelled | NegotiatorState::Disconnected)
    }

    /// A session exists and has not ended.
    pub fn is_live(self) -> bool {
        self != NegotiatorState::Idle && !self.is_terminal()
    }
}

/// Events published by the negotiator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// State transition.
    StateChanged {
        /// Previous state.
        from: NegotiatorState,
        /// New state.
        to: NegotiatorState,
    },
    /// The local blob is ready to hand to the other player.
    LocalDescriptionReady(SignalingBlob),
    /// Transport connected and channel open.
    Connected,
    /// Setup failed before the session went live; the negotiator can be retried.
    SetupFailed(String),
    /// Never connected within the connect timeout.
    TimedOut,
    /// Negotiation or connectivity failed.
    Failed(String),
    /// A connected session dropped.
    Disconnected,
    /// Torn down by the user.
    Cancelled,
}

/// Negotiation errors.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// A session is already in progress.
    #[error("a session is already active")]
    SessionActive,

    /// The call does not apply to the current state.
    #[error("not allowed while {0:?}")]
    InvalidState(NegotiatorState),

    /// The pasted blob was rejected. State is unchanged.
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A setup step overran the connect deadline. The session has failed.
    #[error("{0} did not finish before the connect deadline")]
    TimedOut(&'static str),
}

/// Negotiator settings.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Ceiling on candidate gathering before the blob is emitted anyway.
    pub gather_timeout: Duration,
    /// Session-wide limit for reaching `Connected`.
    pub connect_timeout: Duration,
    /// ICE servers handed to the transport.
    pub ice_servers: Vec<IceServerConfig>,
    /// Data channel label.
    pub channel_label: String,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            gather_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            ice_servers: Vec::new(),
            channel_label: "tank-duel".to_string(),
        }
    }
}

/// Owns one peer session.
pub struct SessionNegotiator {
    id: Uuid,
    config: NegotiatorConfig,
    factory: Arc<dyn TransportFactory>,
    state: NegotiatorState,
    role: Option<Role>,
    transport: Option<Arc<dyn PeerTransport>>,
    transport_events: Option<TransportEventReceiver>,
    channel: Option<Arc<dyn DataChannel>>,
    local_blob: Option<SignalingBlob>,
    remote_applied: bool,
    transport_connected: bool,
    channel_open: bool,
    connect_deadline: Option<Instant>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionNegotiator {
    /// Create an idle negotiator.
    pub fn new(config: NegotiatorConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            id: Uuid::new_v4(),
            config,
            factory,
            state: NegotiatorState::Idle,
            role: None,
            transport: None,
            transport_events: None,
            channel: None,
            local_blob: None,
            remote_applied: false,
            transport_connected: false,
            channel_open: false,
            connect_deadline: None,
            event_tx,
        }
    }

    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    /// Role, once started.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Transport connected and channel open.
    pub fn is_connected(&self) -> bool {
        self.state == NegotiatorState::Connected
    }

    /// The data channel, once known.
    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.clone()
    }

    /// The local blob, once produced.
    pub fn local_blob(&self) -> Option<&SignalingBlob> {
        self.local_blob.as_ref()
    }

    /// Whether a transport currently exists.
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// When the connect timeout fires, if armed.
    pub fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    /// Subscribe to session events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    fn short_id(&self) -> String {
        hex::encode(&self.id.as_bytes()[..4])
    }

    // =========================================================================
    // STARTING
    // =========================================================================

    /// Begin as the initiator: build the transport and channel, create the
    /// offer, gather candidates (bounded) and return the offer blob.
    #[instrument(skip(self))]
    pub async fn start_as_initiator(&mut self) -> Result<SignalingBlob, NegotiationError> {
        self.ensure_idle()?;
        self.role = Some(Role::Initiator);
        self.transition(NegotiatorState::Negotiating);

        match self.build_offer().await {
            Ok(blob) => Ok(self.publish_local(blob)),
            Err(e) => {
                self.abort_setup(NegotiatorState::Idle, &e).await;
                self.role = None;
                Err(e)
            }
        }
    }

    async fn build_offer(&mut self) -> Result<SignalingBlob, NegotiationError> {
        let transport = self.install_transport().await?;
        let deadline = self.step_deadline();
        let label = self.config.channel_label.clone();
        let channel = bounded(deadline, "data channel creation", transport.create_channel(&label)).await?;
        self.channel = Some(channel);
        bounded(deadline, "offer creation", transport.create_offer()).await?;
        self.gather(&transport).await
    }

    /// Begin as the responder: wait for the initiator's offer. No transport
    /// exists until a valid offer is accepted.
    pub fn start_as_responder(&mut self) -> Result<(), NegotiationError> {
        self.ensure_idle()?;
        self.role = Some(Role::Responder);
        self.transition(NegotiatorState::AwaitingRemote);
        Ok(())
    }

    /// Accept the blob pasted by the user.
    ///
    /// Responder: validates the offer, builds the transport, answers and
    /// returns `Some(answer)`. Initiator: validates and applies the answer,
    /// returns `None`; the session connects asynchronously. A malformed blob
    /// leaves the state untouched.
    #[instrument(skip(self, text))]
    pub async fn accept_remote_description(
        &mut self,
        text: &str,
    ) -> Result<Option<SignalingBlob>, NegotiationError> {
        if self.state != NegotiatorState::AwaitingRemote || self.remote_applied {
            return Err(NegotiationError::InvalidState(self.state));
        }

        match self.role {
            Some(Role::Initiator) => {
                let answer = SignalingBlob::decode_expecting(text, SignalingKind::Answer)?;
                let transport = self
                    .transport
                    .clone()
                    .ok_or(NegotiationError::InvalidState(self.state))?;
                let applied = bounded(self.step_deadline(), "applying the answer", transport.apply_remote(&answer)).await;
                if let Err(e) = applied {
                    if matches!(e, NegotiationError::TimedOut(_)) {
                        self.abort_setup(NegotiatorState::AwaitingRemote, &e).await;
                    }
                    return Err(e);
                }
                self.remote_applied = true;
                info!("Answer applied, waiting for connectivity");
                Ok(None)
            }
            Some(Role::Responder) => {
                let offer = SignalingBlob::decode_expecting(text, SignalingKind::Offer)?;
                self.transition(NegotiatorState::Negotiating);
                match self.build_answer(&offer).await {
                    Ok(blob) => {
                        self.remote_applied = true;
                        Ok(Some(self.publish_local(blob)))
                    }
                    Err(e) => {
                        self.abort_setup(NegotiatorState::AwaitingRemote, &e).await;
                        Err(e)
                    }
                }
            }
            None => Err(NegotiationError::InvalidState(self.state)),
        }
    }

    async fn build_answer(&mut self, offer: &SignalingBlob) -> Result<SignalingBlob, NegotiationError> {
        let transport = self.install_transport().await?;
        let deadline = self.step_deadline();
        bounded(deadline, "applying the offer", transport.apply_remote(offer)).await?;
        bounded(deadline, "answer creation", transport.create_answer()).await?;
        self.gather(&transport).await
    }

    fn ensure_idle(&self) -> Result<(), NegotiationError> {
        match self.state {
            NegotiatorState::Idle => Ok(()),
            s if s.is_live() => Err(NegotiationError::SessionActive),
            s => Err(NegotiationError::InvalidState(s)),
        }
    }

    async fn install_transport(&mut self) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        self.connect_deadline = Some(deadline);
        let factory = self.factory.clone();
        let ice_servers = self.config.ice_servers.clone();
        let parts = bounded(deadline, "transport creation", factory.create(&ice_servers)).await?;
        self.transport = Some(parts.transport.clone());
        self.transport_events = Some(parts.events);
        Ok(parts.transport)
    }

    /// Limit for the setup step about to run.
    fn step_deadline(&self) -> Instant {
        self.connect_deadline
            .unwrap_or_else(|| Instant::now() + self.config.connect_timeout)
    }

    async fn gather(&mut self, transport: &Arc<dyn PeerTransport>) -> Result<SignalingBlob, NegotiationError> {
        self.transition(NegotiatorState::GatheringCandidates);
        let deadline = self.step_deadline();
        let ceiling = self.config.gather_timeout;
        let gathered = tokio::time::timeout_at(
            (Instant::now() + ceiling).min(deadline),
            transport.wait_gathering_complete(),
        )
        .await;
        if gathered.is_err() {
            warn!("Candidate gathering exceeded {:?}; using partial candidates", ceiling);
        }
        let description = async {
            transport
                .local_description()
                .await
                .ok_or_else(|| TransportError::Setup("no local description".into()))
        };
        bounded(deadline, "reading the local description", description).await
    }

    fn publish_local(&mut self, blob: SignalingBlob) -> SignalingBlob {
        self.local_blob = Some(blob.clone());
        self.transition(NegotiatorState::AwaitingRemote);
        info!("Local {} ready ({} bytes)", blob.kind(), blob.sdp().len());
        let _ = self.event_tx.send(SessionEvent::LocalDescriptionReady(blob.clone()));
        blob
    }

    async fn abort_setup(&mut self, fallback: NegotiatorState, err: &NegotiationError) {
        if let NegotiationError::TimedOut(step) = err {
            warn!("Session {} stalled in {}", self.short_id(), step);
            self.fail(SessionEvent::TimedOut).await;
            return;
        }
        warn!("Session setup failed: {}", err);
        self.release().await;
        self.transition(fallback);
        let _ = self.event_tx.send(SessionEvent::SetupFailed(err.to_string()));
    }

    // =========================================================================
    // RUNNING
    // =========================================================================

    /// Next queued transport event. Pending forever while there is no transport.
    pub async fn next_transport_event(&mut self) -> Option<TransportEvent> {
        let Some(events) = self.transport_events.as_mut() else {
            return std::future::pending().await;
        };
        let event = events.recv().await;
        if event.is_none() {
            self.transport_events = None;
        }
        event
    }

    /// Next queued transport event without waiting.
    pub fn try_next_transport_event(&mut self) -> Option<TransportEvent> {
        self.transport_events.as_mut()?.try_recv().ok()
    }

    /// Fold one transport event into the session state. Frames are ignored
    /// here; they belong to the channel protocol.
    pub async fn handle_transport_event(&mut self, event: &TransportEvent) -> Option<SessionEvent> {
        if !self.state.is_live() {
            debug!("Ignoring {:?} in {:?}", event, self.state);
            return None;
        }

        match event {
            TransportEvent::StateChanged(PeerConnectionState::Connected) => {
                self.transport_connected = true;
                self.check_connected()
            }
            TransportEvent::StateChanged(PeerConnectionState::Failed) => {
                Some(self.fail(SessionEvent::Failed("transport failed".into())).await)
            }
            TransportEvent::StateChanged(
                PeerConnectionState::Disconnected | PeerConnectionState::Closed,
            ) => Some(self.drop_session("transport disconnected").await),
            TransportEvent::StateChanged(state) => {
                debug!("Transport state {:?}", state);
                None
            }
            TransportEvent::ChannelAnnounced(channel) => {
                if self.role == Some(Role::Responder) && self.channel.is_none() {
                    info!("Data channel '{}' announced by initiator", channel.label());
                    self.channel = Some(channel.clone());
                    if channel.is_open() {
                        self.channel_open = true;
                        return self.check_connected();
                    }
                }
                None
            }
            TransportEvent::ChannelOpen => {
                self.channel_open = true;
                self.check_connected()
            }
            TransportEvent::ChannelClosed => {
                self.channel_open = false;
                Some(self.drop_session("data channel closed").await)
            }
            TransportEvent::ChannelError(e) => {
                warn!("Data channel error: {}", e);
                None
            }
            TransportEvent::Frame(_) => None,
        }
    }

    fn check_connected(&mut self) -> Option<SessionEvent> {
        if !(self.transport_connected && self.channel_open && self.channel.is_some()) {
            return None;
        }
        if self.state == NegotiatorState::Connected {
            return None;
        }
        self.connect_deadline = None;
        self.transition(NegotiatorState::Connected);
        info!("Session {} connected", self.short_id());
        let _ = self.event_tx.send(SessionEvent::Connected);
        Some(SessionEvent::Connected)
    }

    async fn drop_session(&mut self, reason: &str) -> SessionEvent {
        if self.state == NegotiatorState::Connected {
            info!("Session {} dropped: {}", self.short_id(), reason);
            self.release().await;
            self.transition(NegotiatorState::Disconnected);
            let _ = self.event_tx.send(SessionEvent::Disconnected);
            SessionEvent::Disconnected
        } else {
            self.fail(SessionEvent::Failed(reason.to_string())).await
        }
    }

    async fn fail(&mut self, event: SessionEvent) -> SessionEvent {
        warn!("Session {} failed: {:?}", self.short_id(), event);
        self.release().await;
        self.transition(NegotiatorState::Failed);
        let _ = self.event_tx.send(event.clone());
        event
    }

    /// Fire the connect timeout if it is due. Only acts on sessions that
    /// never reached `Connected`.
    pub async fn on_connect_timeout(&mut self, now: Instant) -> Option<SessionEvent> {
        let deadline = self.connect_deadline?;
        if now < deadline || !self.state.is_live() || self.state == NegotiatorState::Connected {
            return None;
        }
        Some(self.fail(SessionEvent::TimedOut).await)
    }

    /// Tear everything down unconditionally. Calling it again is a no-op.
    pub async fn cancel(&mut self) -> Option<SessionEvent> {
        self.release().await;
        if self.state == NegotiatorState::Cancelled {
            return None;
        }
        self.transition(NegotiatorState::Cancelled);
        let _ = self.event_tx.send(SessionEvent::Cancelled);
        Some(SessionEvent::Cancelled)
    }

    /// Close channel and transport, disarm the timeout.
    async fn release(&mut self) {
        self.connect_deadline = None;
        self.transport_connected = false;
        self.channel_open = false;
        self.transport_events = None;
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }

    fn transition(&mut self, to: NegotiatorState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!("Session {} {:?} -> {:?}", self.short_id(), from, to);
        let _ = self.event_tx.send(SessionEvent::StateChanged { from, to });
    }
}

/// Run one transport step, failing once `deadline` passes.
async fn bounded<T>(
    deadline: Instant,
    step: &'static str,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, NegotiationError> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(NegotiationError::TimedOut(step)),
    }
}
