//! RTCP reception and transmission statistics (RFC 3550 section 6.4 and
//! appendices A.3 and A.8)

use std::time::{Duration, Instant};

use rtp_core::packet::rtcp::duration_to_compact;
use rtp_core::{NtpTimestamp, RtcpReportBlock, RtcpSenderReport, RtpSequenceNumber, RtpSsrc, RtpTimestamp};
use serde::Serialize;

use crate::jitter_buffer::{extend_sequence, MAX_DROPOUT};

/// Extended sequence numbers start one cycle in, see `JitterBuffer`
const SEQ_CYCLE: u64 = 1 << 16;

/// Largest value of the 24-bit cumulative loss field
const MAX_CUMULATIVE_LOST: i64 = 0x7F_FFFF;

/// Statistics of one received stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReceiveStatistics {
    pub ssrc: RtpSsrc,
    pub packets_received: u64,
    pub packets_expected: u64,
    /// Expected minus received; negative with duplicates
    pub cumulative_lost: i64,
    /// Loss fraction of the last report interval, in `[0, 1]`
    pub fraction_lost: f64,
    /// Interarrival jitter in milliseconds
    pub jitter_ms: f64,
    pub octets_received: u64,
}

/// Reception state for one remote SSRC
#[derive(Debug, Clone)]
pub struct ReceiverStats {
    ssrc: RtpSsrc,
    clock_rate: u32,
    base_seq: u64,
    max_seq: Option<u64>,
    received: u64,
    octets: u64,
    expected_prior: u64,
    received_prior: u64,
    last_fraction: u8,
    /// Interarrival jitter in timestamp units
    jitter: f64,
    last_transit: Option<u32>,
    /// Reference for converting arrival times to timestamp units
    epoch: Option<Instant>,
    /// Compact NTP time of the last SR and when it arrived
    last_sr: Option<(u32, Instant)>,
}

impl ReceiverStats {
    pub fn new(ssrc: RtpSsrc, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate: clock_rate.max(1),
            base_seq: 0,
            max_seq: None,
            received: 0,
            octets: 0,
            expected_prior: 0,
            received_prior: 0,
            last_fraction: 0,
            jitter: 0.0,
            last_transit: None,
            epoch: None,
            last_sr: None,
        }
    }

    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    /// Account for a packet that passed SRTP checks, whether or not the
    /// jitter buffer keeps it
    pub fn on_packet(
        &mut self,
        sequence: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        payload_len: usize,
        arrival: Instant,
    ) {
        match self.max_seq {
            None => self.restart(sequence),
            Some(max) => {
                let extended = extend_sequence(max, sequence);
                if extended > max && extended - max > MAX_DROPOUT {
                    self.restart(sequence);
                } else if extended > max {
                    self.max_seq = Some(extended);
                }
            }
        }
        self.received += 1;
        self.octets += payload_len as u64;

        // RFC 3550 A.8, all arithmetic modulo 2^32 like the timestamps
        let epoch = *self.epoch.get_or_insert(arrival);
        let arrival_units = (arrival.saturating_duration_since(epoch).as_secs_f64() * self.clock_rate as f64) as u64;
        let transit = (arrival_units as u32).wrapping_sub(timestamp);
        if let Some(last) = self.last_transit {
            let d = (transit.wrapping_sub(last) as i32).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    /// Remember a sender report from this source for LSR/DLSR
    pub fn on_sender_report(&mut self, report: &RtcpSenderReport, arrival: Instant) {
        self.last_sr = Some((report.ntp_timestamp.to_compact(), arrival));
    }

    pub fn expected(&self) -> u64 {
        self.max_seq.map_or(0, |max| max - self.base_seq + 1)
    }

    pub fn cumulative_lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }

    /// Interarrival jitter in timestamp units
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Build the report block for this source and start a new interval
    pub fn report_block(&mut self, now: Instant) -> RtcpReportBlock {
        let expected = self.expected();
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval as i64 - received_interval as i64;
        self.last_fraction = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64).min(255) as u8
        };

        let (last_sr, delay_since_last_sr) = match self.last_sr {
            Some((compact, at)) => (compact, duration_to_compact(now.saturating_duration_since(at))),
            None => (0, 0),
        };

        RtcpReportBlock {
            ssrc: self.ssrc,
            fraction_lost: self.last_fraction,
            cumulative_lost: self.cumulative_lost().clamp(0, MAX_CUMULATIVE_LOST) as u32,
            highest_seq: self.max_seq.map_or(0, |max| max.saturating_sub(SEQ_CYCLE) as u32),
            jitter: self.jitter as u32,
            last_sr,
            delay_since_last_sr,
        }
    }

    pub fn snapshot(&self) -> ReceiveStatistics {
        ReceiveStatistics {
            ssrc: self.ssrc,
            packets_received: self.received,
            packets_expected: self.expected(),
            cumulative_lost: self.cumulative_lost(),
            fraction_lost: self.last_fraction as f64 / 256.0,
            jitter_ms: self.jitter * 1000.0 / self.clock_rate as f64,
            octets_received: self.octets,
        }
    }

    fn restart(&mut self, sequence: RtpSequenceNumber) {
        let extended = SEQ_CYCLE | sequence as u64;
        self.base_seq = extended;
        self.max_seq = Some(extended);
        self.received = 0;
        self.expected_prior = 0;
        self.received_prior = 0;
    }
}

/// Statistics of one sent stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SendStatistics {
    pub ssrc: RtpSsrc,
    pub packets_sent: u64,
    pub octets_sent: u64,
    pub frames_sent: u64,
}

/// Transmission state for one local SSRC
#[derive(Debug, Clone)]
pub struct SenderStats {
    ssrc: RtpSsrc,
    clock_rate: u32,
    packets: u64,
    octets: u64,
    frames: u64,
    /// Last RTP timestamp sent and when
    last_sent: Option<(RtpTimestamp, Instant)>,
}

impl SenderStats {
    pub fn new(ssrc: RtpSsrc, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate,
            packets: 0,
            octets: 0,
            frames: 0,
            last_sent: None,
        }
    }

    pub fn on_frame_sent(&mut self, timestamp: RtpTimestamp, packets: usize, payload_octets: usize, at: Instant) {
        self.frames += 1;
        self.packets += packets as u64;
        self.octets += payload_octets as u64;
        self.last_sent = Some((timestamp, at));
    }

    pub fn has_sent(&self) -> bool {
        self.last_sent.is_some()
    }

    /// Sender report for the current wall clock. The RTP timestamp is
    /// extrapolated from the last frame sent.
    pub fn sender_report(&self, now: Instant, ntp: NtpTimestamp) -> RtcpSenderReport {
        let rtp_timestamp = match self.last_sent {
            Some((timestamp, at)) => {
                let elapsed = now.saturating_duration_since(at);
                timestamp.wrapping_add(to_clock_units(elapsed, self.clock_rate))
            }
            None => 0,
        };
        let mut report = RtcpSenderReport::new(self.ssrc, ntp, rtp_timestamp);
        // Counters wrap per RFC 3550 section 6.4.1
        report.sender_packet_count = self.packets as u32;
        report.sender_octet_count = self.octets as u32;
        report
    }

    pub fn snapshot(&self) -> SendStatistics {
        SendStatistics {
            ssrc: self.ssrc,
            packets_sent: self.packets,
            octets_sent: self.octets,
            frames_sent: self.frames,
        }
    }
}

fn to_clock_units(elapsed: Duration, clock_rate: u32) -> u32 {
    (elapsed.as_secs_f64() * clock_rate as f64) as u64 as u32
}
