//! WebRTC Transport
//!
//! Production implementation of the transport seam on top of `webrtc`.
//! Callbacks registered on the peer connection and data channel only forward
//! into the event queue; all decisions are made by the task draining it.

use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::signaling::{SignalingBlob, SignalingKind};
use super::relay::IceServerConfig;
use super::transport::{
    DataChannel, PeerConnectionState, PeerTransport, TransportError, TransportEvent,
    TransportEventSender, TransportFactory, TransportParts,
};

fn setup_error(err: webrtc::Error) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        _ => None,
    }
}

fn rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

// =============================================================================
// FACTORY
// =============================================================================

/// Builds WebRTC peer connections.
pub struct WebRtcTransportFactory {
    api: API,
}

impl Default for WebRtcTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WebRtcTransportFactory {
    /// Data-channel-only API; no media codecs are registered.
    pub fn new() -> Self {
        Self { api: APIBuilder::new().build() }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, ice_servers: &[IceServerConfig]) -> Result<TransportParts, TransportError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(setup_error)?);
        let (tx, rx) = mpsc::unbounded_channel();

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                debug!("Peer connection state: {}", state);
                if let Some(mapped) = map_state(state) {
                    let _ = tx.send(TransportEvent::StateChanged(mapped));
                }
            })
        }));

        let channel_tx = tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = channel_tx.clone();
            Box::pin(async move {
                debug!("Remote data channel announced: {}", dc.label());
                let channel = WebRtcChannel::attach(dc, tx.clone());
                let already_open = channel.is_open();
                let _ = tx.send(TransportEvent::ChannelAnnounced(channel));
                if already_open {
                    let _ = tx.send(TransportEvent::ChannelOpen);
                }
            })
        }));

        Ok(TransportParts {
            transport: Arc::new(WebRtcTransport { pc, events: tx, gathering: Mutex::new(None) }),
            events: rx,
        })
    }
}

// =============================================================================
// PEER CONNECTION
// =============================================================================

/// A WebRTC peer connection.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: TransportEventSender,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
}

impl WebRtcTransport {
    async fn install_local(&self, description: RTCSessionDescription) -> Result<(), TransportError> {
        // Promise must be taken before the local description starts gathering
        let done = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(description).await.map_err(setup_error)?;
        *self.gathering.lock().unwrap_or_else(|p| p.into_inner()) = Some(done);
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(setup_error)?;
        Ok(WebRtcChannel::attach(dc, self.events.clone()))
    }

    async fn create_offer(&self) -> Result<(), TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(setup_error)?;
        self.install_local(offer).await
    }

    async fn create_answer(&self) -> Result<(), TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(setup_error)?;
        self.install_local(answer).await
    }

    async fn apply_remote(&self, blob: &SignalingBlob) -> Result<(), TransportError> {
        let sdp = blob.sdp().to_string();
        let description = match blob.kind() {
            SignalingKind::Offer => RTCSessionDescription::offer(sdp),
            SignalingKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(setup_error)?;
        self.pc.set_remote_description(description).await.map_err(setup_error)
    }

    async fn wait_gathering_complete(&self) {
        let pending = self.gathering.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut done) = pending {
            let _ = done.recv().await;
        }
    }

    async fn local_description(&self) -> Option<SignalingBlob> {
        let description = self.pc.local_description().await?;
        let kind = match description.sdp_type {
            RTCSdpType::Offer => SignalingKind::Offer,
            RTCSdpType::Answer => SignalingKind::Answer,
            _ => return None,
        };
        Some(SignalingBlob::new(kind, description.sdp))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {}", e);
        }
    }
}

// =============================================================================
// DATA CHANNEL
// =============================================================================

/// A WebRTC data channel forwarding its lifecycle into the event queue.
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    fn attach(dc: Arc<RTCDataChannel>, events: TransportEventSender) -> Arc<dyn DataChannel> {
        let tx = events.clone();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::ChannelOpen);
            })
        }));

        let tx = events.clone();
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::ChannelClosed);
            })
        }));

        let tx = events.clone();
        dc.on_error(Box::new(move |err: webrtc::Error| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::ChannelError(err.to_string()));
            })
        }));

        let tx = events;
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                if !msg.is_string {
                    warn!("Dropping binary frame of {} bytes", msg.data.len());
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = tx.send(TransportEvent::Frame(text));
                    }
                    Err(_) => warn!("Dropping non-utf8 text frame"),
                }
            })
        }));

        Arc::new(Self { dc })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("Data channel close: {}", e);
        }
    }
}
