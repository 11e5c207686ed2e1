//! Events published by a peer session

use ice_core::{IceAgentStats, IceCandidate};
use media_core::{MediaFrame, MediaStats};
use rtp_core::{RtpSequenceNumber, RtpSsrc};

use crate::errors::SessionError;
use crate::types::{SessionId, SessionState};

/// Statistics snapshot of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub state: SessionState,
    /// Offer/answer rounds completed
    pub negotiation_rounds: u64,
    pub ice: IceAgentStats,
    /// Present once media flows
    pub media: Option<MediaStats>,
}

/// Lifecycle, candidate and media events of a session.
///
/// Every terminal failure is published as [`SessionEvent::Failed`] after the
/// state has moved to [`SessionState::Failed`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),

    /// Secured media path established
    Connected,

    /// Consent freshness lapsed on the selected pair
    Disconnected,

    Failed(SessionError),

    /// A local candidate to trickle to the peer
    LocalCandidate(IceCandidate),

    /// Local gathering finished
    GatheringComplete,

    FrameReceived {
        ssrc: RtpSsrc,
        frame: MediaFrame,
    },

    /// Informational, the session keeps running
    LatePacketDiscarded {
        ssrc: RtpSsrc,
        sequence_number: RtpSequenceNumber,
        total: u64,
    },

    TargetBitrateChanged {
        bps: u64,
    },

    Stats(SessionStats),

    Closed,
}

impl SessionEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged(_) => "state_changed",
            SessionEvent::Connected => "connected",
            SessionEvent::Disconnected => "disconnected",
            SessionEvent::Failed(_) => "failed",
            SessionEvent::LocalCandidate(_) => "local_candidate",
            SessionEvent::GatheringComplete => "gathering_complete",
            SessionEvent::FrameReceived { .. } => "frame_received",
            SessionEvent::LatePacketDiscarded { .. } => "late_packet_discarded",
            SessionEvent::TargetBitrateChanged { .. } => "target_bitrate_changed",
            SessionEvent::Stats(_) => "stats",
            SessionEvent::Closed => "closed",
        }
    }
}
