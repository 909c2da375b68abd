//! Channel Protocol
//!
//! Sits on top of the ordered data channel. Outbound typed messages are
//! wrapped in a stamped envelope and sent as one text frame; inbound frames
//! are parsed and handed back typed. A frame that fails to parse is logged
//! and dropped; it never tears the session down.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::session::transport::DataChannel;
use super::envelope::{Envelope, Message};

/// Channel lifecycle as seen by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLifecycle {
    /// Not yet open.
    Connecting,
    /// Frames flow.
    Open,
    /// Closed; nothing more will flow.
    Closed,
}

/// Lifecycle notifications. Each transition is published once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel opened.
    Open,
    /// The channel closed.
    Close,
    /// The channel reported an error.
    Error(String),
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    /// Typed message.
    pub message: Message,
    /// Sender's timestamp (ms since epoch).
    pub timestamp: i64,
}

/// Frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Frames sent.
    pub sent: u64,
    /// Sends skipped because the channel was not open.
    pub skipped: u64,
    /// Frames received and decoded.
    pub received: u64,
    /// Frames received and dropped as malformed.
    pub dropped: u64,
}

/// Typed messaging over one data channel.
pub struct ChannelProtocol {
    channel: Arc<dyn DataChannel>,
    lifecycle: ChannelLifecycle,
    error_reported: bool,
    stats: ChannelStats,
    event_tx: broadcast::Sender<ChannelEvent>,
}

impl ChannelProtocol {
    /// Wrap a data channel. Call [`on_open`](Self::on_open) once it opens.
    pub fn new(channel: Arc<dyn DataChannel>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            channel,
            lifecycle: ChannelLifecycle::Connecting,
            error_reported: false,
            stats: ChannelStats::default(),
            event_tx,
        }
    }

    /// Current lifecycle.
    pub fn lifecycle(&self) -> ChannelLifecycle {
        self.lifecycle
    }

    /// Whether a send would go out now.
    pub fn is_open(&self) -> bool {
        self.lifecycle == ChannelLifecycle::Open && self.channel.is_open()
    }

    /// Frame counters.
    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.event_tx.subscribe()
    }

    /// Send one message. Returns false (and sends nothing) if the channel is
    /// not open or the transport refuses the frame.
    pub async fn send(&mut self, message: &Message) -> bool {
        if !self.is_open() {
            self.stats.skipped += 1;
            debug!("Channel not open, skipping {}", message.kind());
            return false;
        }

        let frame = match Envelope::wrap(message).to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.kind(), e);
                return false;
            }
        };

        match self.channel.send_text(frame).await {
            Ok(()) => {
                self.stats.sent += 1;
                true
            }
            Err(e) => {
                warn!("Failed to send {}: {}", message.kind(), e);
                self.stats.skipped += 1;
                false
            }
        }
    }

    /// Decode one inbound frame. Malformed frames are logged and dropped.
    pub fn on_frame(&mut self, raw: &str) -> Option<Received> {
        let decoded = Envelope::from_json(raw).and_then(|env| {
            env.message().map(|message| Received { message, timestamp: env.timestamp })
        });
        match decoded {
            Ok(received) => {
                self.stats.received += 1;
                Some(received)
            }
            Err(e) => {
                self.stats.dropped += 1;
                warn!("Dropping inbound frame: {}", e);
                None
            }
        }
    }

    /// Record that the channel opened.
    pub fn on_open(&mut self) -> Option<ChannelEvent> {
        if self.lifecycle != ChannelLifecycle::Connecting {
            return None;
        }
        self.lifecycle = ChannelLifecycle::Open;
        self.error_reported = false;
        info!("Data channel '{}' open", self.channel.label());
        self.publish(ChannelEvent::Open)
    }

    /// Record that the channel closed.
    pub fn on_close(&mut self) -> Option<ChannelEvent> {
        if self.lifecycle == ChannelLifecycle::Closed {
            return None;
        }
        self.lifecycle = ChannelLifecycle::Closed;
        info!("Data channel '{}' closed", self.channel.label());
        self.publish(ChannelEvent::Close)
    }

    /// Record a channel error. Reported once per lifecycle phase.
    pub fn on_error(&mut self, reason: &str) -> Option<ChannelEvent> {
        if self.error_reported {
            return None;
        }
        self.error_reported = true;
        warn!("Data channel error: {}", reason);
        self.publish(ChannelEvent::Error(reason.to_string()))
    }

    /// Close the underlying channel.
    pub async fn close(&mut self) {
        self.channel.close().await;
        self.on_close();
    }

    fn publish(&self, event: ChannelEvent) -> Option<ChannelEvent> {
        let _ = self.event_tx.send(event.clone());
        Some(event)
    }
}
