//! Signaling channel abstraction
//!
//! The engine never delivers descriptions or candidates itself. Applications
//! implement [`SignalingChannel`] over whatever they use (WebSocket, HTTP,
//! a message bus) and move [`SignalMessage`]s between the two sessions.

use async_trait::async_trait;
use ice_core::IceCandidate;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::errors::{Result, SessionError};
use crate::sdp::{SdpType, SessionDescription};

/// One message exchanged over signaling, JSON encoded on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// An offer or answer in SDP text form
    Description { sdp_type: SdpType, sdp: String },

    /// A trickled candidate in `candidate:` attribute form
    Candidate { candidate: String },

    /// The sender has no more candidates
    EndOfCandidates,
}

impl SignalMessage {
    pub fn description(description: &SessionDescription) -> Self {
        SignalMessage::Description {
            sdp_type: description.sdp_type,
            sdp: description.to_sdp_string(),
        }
    }

    pub fn candidate(candidate: &IceCandidate) -> Self {
        SignalMessage::Candidate {
            candidate: candidate.to_sdp_string(),
        }
    }

    /// Decode the carried description, if this is one
    pub fn to_description(&self) -> Result<Option<SessionDescription>> {
        match self {
            SignalMessage::Description { sdp_type, sdp } => {
                SessionDescription::parse(*sdp_type, sdp).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Decode the carried candidate, if this is one
    pub fn to_candidate(&self) -> Result<Option<IceCandidate>> {
        match self {
            SignalMessage::Candidate { candidate } => Ok(Some(IceCandidate::from_sdp_string(candidate)?)),
            _ => Ok(None),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SessionError::sdp(format!("Failed to encode signal: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SessionError::sdp(format!("Malformed signal: {}", e)))
    }
}

/// Transport for signaling messages between two sessions
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Deliver a message to the remote side
    async fn send(&self, message: SignalMessage) -> Result<()>;

    /// Next message from the remote side, `None` once the channel closed
    async fn recv(&self) -> Option<SignalMessage>;
}

/// In-process signaling pair. Messages travel as JSON text so both ends
/// exercise the same encoding a network channel would.
#[derive(Debug)]
pub struct LoopbackSignaling {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl LoopbackSignaling {
    /// Two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: Mutex::new(b_rx) },
            Self { tx: b_tx, rx: Mutex::new(a_rx) },
        )
    }
}

#[async_trait]
impl SignalingChannel for LoopbackSignaling {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        let json = message.to_json()?;
        trace!("Signaling out: {}", json);
        self.tx
            .send(json)
            .map_err(|_| SessionError::Io("signaling peer is gone".into()))
    }

    async fn recv(&self) -> Option<SignalMessage> {
        loop {
            let json = self.rx.lock().await.recv().await?;
            match SignalMessage::from_json(&json) {
                Ok(message) => return Some(message),
                Err(e) => tracing::warn!("Dropping signaling message: {}", e),
            }
        }
    }
}
