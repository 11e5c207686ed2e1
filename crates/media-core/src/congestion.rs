//! Loss-based sender bitrate control with a delay guard
//!
//! Modelled on the loss controller of Google Congestion Control
//! (draft-ietf-rmcat-gcc section 6): each receiver report updates the
//! target from the reported loss fraction, bounded by the receiver's own
//! estimate (REMB) and by `[min_bitrate, max_bitrate]`.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::config::MediaConfig;

/// Below this loss fraction the rate may grow
pub const LOW_LOSS: f64 = 0.02;

/// Above this loss fraction the rate is cut
pub const HIGH_LOSS: f64 = 0.10;

/// Growth factor applied per report under low loss
pub const INCREASE_FACTOR: f64 = 1.08;

/// RTT above this multiple of the smoothed minimum blocks growth
pub const RTT_GUARD: f64 = 1.5;

/// How slowly the minimum RTT forgets a low sample
const MIN_RTT_DECAY: f64 = 0.01;

/// What a report did to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateDecision {
    Increase,
    Hold,
    Decrease,
}

/// Feedback carried by one receiver report
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossReport {
    /// Loss fraction in `[0, 1]`
    pub fraction_lost: f64,
    /// Latest RTT sample, if the report allowed computing one
    pub rtt: Option<Duration>,
}

/// Sender side target bitrate controller
#[derive(Debug, Clone)]
pub struct CongestionController {
    min_bps: u64,
    max_bps: u64,
    target_bps: u64,
    remote_estimate_bps: Option<u64>,
    /// Smoothed minimum RTT in seconds
    min_rtt: Option<f64>,
    last_decision: RateDecision,
}

impl CongestionController {
    pub fn new(min_bps: u64, start_bps: u64, max_bps: u64) -> Self {
        let max_bps = max_bps.max(min_bps);
        Self {
            min_bps,
            max_bps,
            target_bps: start_bps.clamp(min_bps, max_bps),
            remote_estimate_bps: None,
            min_rtt: None,
            last_decision: RateDecision::Hold,
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(config.min_bitrate_bps, config.start_bitrate_bps, config.max_bitrate_bps)
    }

    pub fn target_bitrate(&self) -> u64 {
        self.target_bps
    }

    pub fn remote_estimate(&self) -> Option<u64> {
        self.remote_estimate_bps
    }

    pub fn last_decision(&self) -> RateDecision {
        self.last_decision
    }

    /// Smoothed minimum RTT used by the delay guard
    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt.map(Duration::from_secs_f64)
    }

    /// Apply a receiver report. Returns the new target when it changed.
    pub fn on_loss_report(&mut self, report: LossReport) -> Option<u64> {
        let loss = report.fraction_lost.clamp(0.0, 1.0);
        let delay_rising = report.rtt.map_or(false, |rtt| self.observe_rtt(rtt));
        let current = self.target_bps as f64;

        let (decision, proposed) = if loss > HIGH_LOSS {
            (RateDecision::Decrease, current * (1.0 - 0.5 * loss))
        } else if loss >= LOW_LOSS || delay_rising {
            (RateDecision::Hold, current)
        } else {
            (RateDecision::Increase, current * INCREASE_FACTOR)
        };

        let mut proposed = proposed.round() as u64;
        if decision == RateDecision::Increase {
            if let Some(remote) = self.remote_estimate_bps {
                // The remote estimate caps growth but never forces a cut here
                proposed = proposed.min(remote.max(self.target_bps));
            }
        }

        self.last_decision = decision;
        self.set_target(proposed, decision)
    }

    /// Apply a receiver estimated maximum bitrate. Lowers the target when it
    /// sits above the estimate.
    pub fn on_remote_estimate(&mut self, bps: u64) -> Option<u64> {
        self.remote_estimate_bps = Some(bps);
        if self.target_bps > bps {
            self.last_decision = RateDecision::Decrease;
            return self.set_target(bps, RateDecision::Decrease);
        }
        None
    }

    /// Track the smoothed minimum; true when `rtt` shows queues building up
    fn observe_rtt(&mut self, rtt: Duration) -> bool {
        let sample = rtt.as_secs_f64();
        let min = match self.min_rtt {
            Some(min) if sample < min => sample,
            Some(min) => min + (sample - min) * MIN_RTT_DECAY,
            None => sample,
        };
        self.min_rtt = Some(min);
        sample > min * RTT_GUARD
    }

    fn set_target(&mut self, proposed: u64, decision: RateDecision) -> Option<u64> {
        let target = proposed.clamp(self.min_bps, self.max_bps);
        if target == self.target_bps {
            return None;
        }
        debug!(
            from = self.target_bps,
            to = target,
            ?decision,
            "Target bitrate changed"
        );
        self.target_bps = target;
        Some(target)
    }
}

/// Receiver side estimate sent back as REMB
///
/// Measures the incoming payload rate over a report interval and allows the
/// sender headroom above it while loss stays low.
#[derive(Debug, Clone)]
pub struct IncomingBitrateEstimator {
    min_bps: u64,
    max_bps: u64,
    bytes: u64,
    since: Option<Instant>,
}

impl IncomingBitrateEstimator {
    pub fn new(min_bps: u64, max_bps: u64) -> Self {
        Self {
            min_bps,
            max_bps: max_bps.max(min_bps),
            bytes: 0,
            since: None,
        }
    }

    pub fn on_packet(&mut self, payload_len: usize, arrival: Instant) {
        self.since.get_or_insert(arrival);
        self.bytes += payload_len as u64;
    }

    /// Estimate for the interval ending at `now`, then start a new interval.
    /// `None` when nothing arrived.
    pub fn estimate(&mut self, now: Instant, fraction_lost: f64) -> Option<u64> {
        let since = self.since.take()?;
        let bytes = std::mem::take(&mut self.bytes);
        let elapsed = now.saturating_duration_since(since).as_secs_f64().max(0.001);
        let incoming_bps = bytes as f64 * 8.0 / elapsed;

        let headroom = if fraction_lost < LOW_LOSS {
            1.5
        } else if fraction_lost <= HIGH_LOSS {
            1.0
        } else {
            0.85
        };
        Some(((incoming_bps * headroom).round() as u64).clamp(self.min_bps, self.max_bps))
    }
}
