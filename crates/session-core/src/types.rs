use std::fmt;

use media_core::{Codec, MediaKind};
use rtp_core::RtpSsrc;
use serde::{Deserialize, Serialize};

use crate::sdp::Direction;

/// Session ID type
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a peer session
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, nothing negotiated yet
    New,
    /// A description has been applied and the round is not complete
    Negotiating,
    /// Connectivity checks or the handshake are running
    Connecting,
    /// Media flows over the secured path
    Connected,
    /// Consent freshness lapsed; may return to Connected
    Disconnected,
    /// Terminal until renegotiated with an ICE restart
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::Negotiating => "negotiating",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Application request for a local media stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub kind: MediaKind,
    /// Codec preferences, most preferred first. Empty means the session
    /// defaults for the kind.
    #[serde(default)]
    pub codecs: Vec<Codec>,
    /// SSRC to send with; random when absent
    #[serde(default)]
    pub ssrc: Option<RtpSsrc>,
    #[serde(default = "default_direction")]
    pub direction: Direction,
}

fn default_direction() -> Direction {
    Direction::SendRecv
}

impl StreamSpec {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            codecs: Vec::new(),
            ssrc: None,
            direction: Direction::SendRecv,
        }
    }

    pub fn audio() -> Self {
        Self::new(MediaKind::Audio)
    }

    pub fn video() -> Self {
        Self::new(MediaKind::Video)
    }

    pub fn with_codecs(mut self, codecs: Vec<Codec>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_ssrc(mut self, ssrc: RtpSsrc) -> Self {
        self.ssrc = Some(ssrc);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}
