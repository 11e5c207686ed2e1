use std::time::Duration;

use crate::packet::rtcp::{compact_to_duration, NtpTimestamp, RtcpReportBlock};

/// Smoothing factor for the RTT estimate (RFC 6298)
const ALPHA: f64 = 0.125;

/// Round-trip time estimator fed by RTCP report blocks
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    /// Smoothed RTT in seconds
    smoothed: Option<f64>,

    /// Minimum RTT seen in seconds
    min_rtt: Option<f64>,

    /// Most recent sample in seconds
    latest: Option<f64>,

    /// Number of samples processed
    samples: u64,
}

impl RttEstimator {
    /// Create an estimator with no samples
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a report block about one of our streams, received at `arrival`.
    ///
    /// Returns the new sample, or `None` when the block carries no SR
    /// reference or the arithmetic goes negative (clock skew, stale block).
    pub fn on_report_block(&mut self, block: &RtcpReportBlock, arrival: NtpTimestamp) -> Option<Duration> {
        if block.last_sr == 0 {
            return None;
        }

        let rtt = arrival
            .to_compact()
            .wrapping_sub(block.last_sr)
            .wrapping_sub(block.delay_since_last_sr);
        if rtt > 0x8000_0000 {
            return None;
        }

        let sample = compact_to_duration(rtt);
        let seconds = sample.as_secs_f64();
        self.smoothed = Some(match self.smoothed {
            Some(current) => (1.0 - ALPHA) * current + ALPHA * seconds,
            None => seconds,
        });
        self.min_rtt = Some(self.min_rtt.map_or(seconds, |m| m.min(seconds)));
        self.latest = Some(seconds);
        self.samples += 1;
        Some(sample)
    }

    /// Smoothed RTT
    pub fn rtt(&self) -> Option<Duration> {
        self.smoothed.map(Duration::from_secs_f64)
    }

    /// Smallest RTT seen
    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt.map(Duration::from_secs_f64)
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<Duration> {
        self.latest.map(Duration::from_secs_f64)
    }

    /// Get all RTT statistics
    pub fn stats(&self) -> RttStats {
        RttStats {
            rtt_ms: self.smoothed.unwrap_or(0.0) * 1000.0,
            min_rtt_ms: self.min_rtt.unwrap_or(0.0) * 1000.0,
            samples: self.samples,
        }
    }
}

/// RTT statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RttStats {
    /// Current RTT estimate in milliseconds
    pub rtt_ms: f64,

    /// Minimum RTT seen in milliseconds
    pub min_rtt_ms: f64,

    /// Number of samples
    pub samples: u64,
}
