use rtp_core::{RtpSequenceNumber, RtpSsrc};
use serde::Serialize;

use crate::jitter_buffer::JitterBufferStats;
use crate::packetizer::MediaFrame;
use crate::stats::{ReceiveStatistics, SendStatistics};

/// Events published by the media pipeline
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A complete frame was reassembled
    FrameReceived { ssrc: RtpSsrc, frame: MediaFrame },

    /// A packet arrived too late for the jitter window. Informational.
    LatePacketDiscarded {
        ssrc: RtpSsrc,
        sequence_number: RtpSequenceNumber,
        /// Late packets discarded on this stream so far
        total: u64,
    },

    /// The congestion controller moved the send target
    TargetBitrateChanged { bps: u64 },

    /// Periodic statistics, published with every RTCP report
    StatsUpdated(MediaStats),
}

/// Statistics of one media stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    pub mid: String,
    pub local_ssrc: RtpSsrc,
    pub remote_ssrc: Option<RtpSsrc>,
    pub send: Option<SendStatistics>,
    pub receive: Option<ReceiveStatistics>,
    pub jitter_buffer: Option<JitterBufferStats>,
    pub frames_received: u64,
    pub incomplete_frames: u64,
}

/// Pipeline-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaStats {
    pub streams: Vec<StreamStats>,
    pub target_bitrate_bps: u64,
    pub remote_estimate_bps: Option<u64>,
    /// Smoothed round-trip time from RTCP, in milliseconds
    pub rtt_ms: Option<f64>,
    /// Packets rejected by SRTP authentication or replay checks
    pub srtp_rejected: u64,
    pub rtcp_reports_sent: u64,
}

impl MediaStats {
    pub fn stream(&self, mid: &str) -> Option<&StreamStats> {
        self.streams.iter().find(|s| s.mid == mid)
    }
}
