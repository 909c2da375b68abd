//! Signaling Blobs
//!
//! The connection descriptions two peers swap by hand (clipboard, chat, voice).
//! A blob is a JSON object `{kind, sdp}` wrapped in base64 so it survives
//! copy/paste through chat clients that mangle whitespace.

use std::fmt;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Which half of the exchange a blob carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingKind {
    /// Produced by the initiator.
    Offer,
    /// Produced by the responder in reply to an offer.
    Answer,
}

impl fmt::Display for SignalingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingKind::Offer => f.write_str("offer"),
            SignalingKind::Answer => f.write_str("answer"),
        }
    }
}

/// A session description plus its kind tag. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingBlob {
    kind: SignalingKind,
    sdp: String,
}

/// Signaling errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    /// The pasted text could not be parsed back into a description.
    #[error("invalid signaling data: {0}")]
    InvalidSignalingData(String),

    /// The local description could not be serialized.
    #[error("cannot encode signaling data: {0}")]
    Encode(String),

    /// A well-formed blob of the wrong kind (e.g. an offer pasted into the initiator).
    #[error("expected {expected} blob, got {found}")]
    UnexpectedKind {
        /// Kind the negotiator was waiting for.
        expected: SignalingKind,
        /// Kind that was supplied.
        found: SignalingKind,
    },
}

impl SignalingBlob {
    /// Wrap a local description.
    pub fn new(kind: SignalingKind, sdp: impl Into<String>) -> Self {
        Self { kind, sdp: sdp.into() }
    }

    /// Blob kind.
    pub fn kind(&self) -> SignalingKind {
        self.kind
    }

    /// Raw session description text.
    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    /// Encode to the text a user copies.
    pub fn encode(&self) -> Result<String, SignalingError> {
        let json = serde_json::to_string(self).map_err(|e| SignalingError::Encode(e.to_string()))?;
        Ok(STANDARD.encode(json.as_bytes()))
    }

    /// Decode pasted text. Accepts the base64 form produced by [`encode`] or
    /// the bare JSON object.
    ///
    /// [`encode`]: SignalingBlob::encode
    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(SignalingError::InvalidSignalingData("empty input".into()));
        }

        let json = if compact.starts_with('{') {
            text.trim().to_string()
        } else {
            let bytes = STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| SignalingError::InvalidSignalingData(format!("not base64: {e}")))?;
            String::from_utf8(bytes)
                .map_err(|_| SignalingError::InvalidSignalingData("not utf-8".into()))?
        };

        let blob: SignalingBlob = serde_json::from_str(&json)
            .map_err(|e| SignalingError::InvalidSignalingData(format!("not a description: {e}")))?;
        blob.validate()?;
        Ok(blob)
    }

    /// Decode and require a specific kind.
    pub fn decode_expecting(text: &str, expected: SignalingKind) -> Result<Self, SignalingError> {
        let blob = Self::decode(text)?;
        if blob.kind != expected {
            return Err(SignalingError::UnexpectedKind { expected, found: blob.kind });
        }
        Ok(blob)
    }

    fn validate(&self) -> Result<(), SignalingError> {
        if !self.sdp.lines().any(|line| line.trim_start().starts_with("v=")) {
            return Err(SignalingError::InvalidSignalingData(
                "description has no version line".into(),
            ));
        }
        Ok(())
    }
}
