//! Sequence-ordered jitter buffer
//!
//! Packets are reordered by extended sequence number. The buffer keeps a
//! window of `window_packets` sequence numbers behind the newest packet seen;
//! anything further back, or at or before the last packet handed out, is late
//! and dropped. A packet exactly `window_packets` behind the newest one is
//! still accepted. Gaps are waited for until the newest packet runs
//! `max_delay_packets` ahead of them, then skipped and counted as lost.

use std::collections::BTreeMap;

use rtp_core::{RtpPacket, RtpSequenceNumber};
use serde::Serialize;
use tracing::{debug, trace};

/// Forward jump that is treated as a sender restart (RFC 3550 appendix A.1)
pub const MAX_DROPOUT: u64 = 3000;

/// Extend a 16-bit sequence number to the extended value closest to
/// `reference`
pub(crate) fn extend_sequence(reference: u64, sequence: RtpSequenceNumber) -> u64 {
    let delta = sequence.wrapping_sub(reference as u16) as i16 as i64;
    (reference as i64 + delta).max(0) as u64
}

/// What happened to a pushed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffered for in-order emission
    Accepted,
    /// Already buffered, dropped
    Duplicate,
    /// Behind the window or already played out, dropped
    Late,
    /// Sequence jumped too far ahead; the buffer restarted from this packet
    Resynchronized,
}

/// Jitter buffer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JitterBufferStats {
    pub packets_received: u64,
    pub packets_emitted: u64,
    /// Packets discarded as late arrivals
    pub packets_late: u64,
    /// Packets discarded as duplicates
    pub packets_duplicate: u64,
    /// Sequence numbers skipped without ever arriving
    pub packets_lost: u64,
    pub resyncs: u64,
    pub buffered: usize,
}

/// Reorders the packets of one SSRC
#[derive(Debug)]
pub struct JitterBuffer {
    window: u64,
    max_delay: u64,
    packets: BTreeMap<u64, RtpPacket>,
    /// Newest extended sequence number seen
    newest: Option<u64>,
    /// Extended sequence number of the last emitted or skipped packet
    last_emitted: u64,
    stats: JitterBufferStats,
}

impl JitterBuffer {
    pub fn new(window_packets: u32, max_delay_packets: u32) -> Self {
        Self {
            window: window_packets as u64,
            max_delay: max_delay_packets as u64,
            packets: BTreeMap::new(),
            newest: None,
            last_emitted: 0,
            stats: JitterBufferStats::default(),
        }
    }

    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            buffered: self.packets.len(),
            ..self.stats.clone()
        }
    }

    /// Number of packets waiting for emission
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Newest extended sequence number seen
    pub fn newest(&self) -> Option<u64> {
        self.newest
    }

    /// Offer a packet to the buffer
    pub fn push(&mut self, packet: RtpPacket) -> PushOutcome {
        self.stats.packets_received += 1;
        let sequence = packet.header.sequence_number;

        let Some(newest) = self.newest else {
            self.restart(packet);
            return PushOutcome::Accepted;
        };

        let extended = extend_sequence(newest, sequence);
        if extended > newest && extended - newest > MAX_DROPOUT {
            debug!(
                ssrc = packet.header.ssrc,
                "Sequence jumped from {} to {}, resynchronizing",
                newest as u16,
                sequence
            );
            self.stats.resyncs += 1;
            self.stats.packets_lost += self.packets.len() as u64;
            self.packets.clear();
            self.restart(packet);
            return PushOutcome::Resynchronized;
        }

        if extended <= self.last_emitted || newest.saturating_sub(extended) > self.window {
            self.stats.packets_late += 1;
            trace!(ssrc = packet.header.ssrc, sequence, newest = newest as u16, "Late packet");
            return PushOutcome::Late;
        }

        if self.packets.contains_key(&extended) {
            self.stats.packets_duplicate += 1;
            return PushOutcome::Duplicate;
        }

        self.packets.insert(extended, packet);
        self.newest = Some(newest.max(extended));
        PushOutcome::Accepted
    }

    /// Take every packet that is ready, in sequence order
    pub fn drain(&mut self) -> Vec<RtpPacket> {
        let mut ready = Vec::new();
        let Some(newest) = self.newest else {
            return ready;
        };

        while let Some(&first) = self.packets.keys().next() {
            let expected = self.last_emitted + 1;
            if first == expected {
                if let Some(packet) = self.packets.remove(&first) {
                    ready.push(packet);
                }
                self.last_emitted = first;
                self.stats.packets_emitted += 1;
            } else if newest - expected > self.max_delay {
                let skipped = first - expected;
                trace!("Skipping {} missing packets before {}", skipped, first as u16);
                self.stats.packets_lost += skipped;
                self.last_emitted = first - 1;
            } else {
                break;
            }
        }
        ready
    }

    /// Emit everything still buffered, skipping gaps
    pub fn flush(&mut self) -> Vec<RtpPacket> {
        let mut ready = Vec::with_capacity(self.packets.len());
        while let Some((extended, packet)) = self.packets.pop_first() {
            self.stats.packets_lost += extended - self.last_emitted - 1;
            self.stats.packets_emitted += 1;
            self.last_emitted = extended;
            ready.push(packet);
        }
        ready
    }

    fn restart(&mut self, packet: RtpPacket) {
        // Start one cycle in so packets slightly older than the first one
        // still extend to valid values
        let extended = (1u64 << 16) | packet.header.sequence_number as u64;
        self.newest = Some(extended);
        self.last_emitted = extended - 1;
        self.packets.insert(extended, packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn packet(sequence: u16) -> RtpPacket {
        RtpPacket::new_with_payload(96, sequence, sequence as u32 * 10, 0x1234, Bytes::from_static(b"p"))
    }

    fn sequences(packets: &[RtpPacket]) -> Vec<u16> {
        packets.iter().map(|p| p.header.sequence_number).collect()
    }

    #[test]
    fn test_extend_sequence() {
        assert_eq!(extend_sequence(65_536 + 10, 12), 65_536 + 12);
        assert_eq!(extend_sequence(65_536 + 10, 5), 65_536 + 5);
        assert_eq!(extend_sequence(65_536 + 65_535, 1), 2 * 65_536 + 1);
        assert_eq!(extend_sequence(2 * 65_536 + 1, 65_535), 65_536 + 65_535);
    }

    #[test]
    fn test_reorders_within_window() {
        let mut buffer = JitterBuffer::new(10, 10);
        assert_eq!(buffer.push(packet(100)), PushOutcome::Accepted);
        assert_eq!(sequences(&buffer.drain()), vec![100]);

        buffer.push(packet(102));
        buffer.push(packet(103));
        assert!(buffer.drain().is_empty());

        buffer.push(packet(101));
        assert_eq!(sequences(&buffer.drain()), vec![101, 102, 103]);
        assert_eq!(buffer.stats().packets_emitted, 4);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let mut buffer = JitterBuffer::new(10, 20);
        buffer.push(packet(0));
        buffer.drain();
        for seq in 2..=11 {
            assert_eq!(buffer.push(packet(seq)), PushOutcome::Accepted);
        }
        assert!(buffer.drain().is_empty());

        // newest 11, 11 - 1 == window
        assert_eq!(buffer.push(packet(1)), PushOutcome::Accepted);
        assert_eq!(buffer.drain().len(), 11);
    }

    #[test]
    fn test_packet_beyond_window_is_late() {
        let mut buffer = JitterBuffer::new(10, 20);
        buffer.push(packet(0));
        buffer.drain();
        for seq in 2..=12 {
            buffer.push(packet(seq));
        }

        // newest 12, 12 - 1 > window
        assert_eq!(buffer.push(packet(1)), PushOutcome::Late);
        assert_eq!(buffer.stats().packets_late, 1);
    }

    #[test]
    fn test_already_emitted_is_late_and_duplicates_counted() {
        let mut buffer = JitterBuffer::new(50, 5);
        buffer.push(packet(10));
        buffer.push(packet(12));
        buffer.drain();

        assert_eq!(buffer.push(packet(12)), PushOutcome::Duplicate);
        assert_eq!(buffer.push(packet(10)), PushOutcome::Late);
        assert_eq!(buffer.push(packet(9)), PushOutcome::Late);

        let stats = buffer.stats();
        assert_eq!(stats.packets_duplicate, 1);
        assert_eq!(stats.packets_late, 2);
        assert_eq!(stats.buffered, 1);
    }

    #[test]
    fn test_gap_skipped_after_max_delay() {
        let mut buffer = JitterBuffer::new(100, 3);
        buffer.push(packet(1));
        buffer.drain();

        // 2 is lost
        for seq in 3..=5 {
            buffer.push(packet(seq));
            assert!(buffer.drain().is_empty());
        }
        buffer.push(packet(6));
        assert_eq!(sequences(&buffer.drain()), vec![3, 4, 5, 6]);
        assert_eq!(buffer.stats().packets_lost, 1);

        // The skipped packet is late when it finally shows up
        assert_eq!(buffer.push(packet(2)), PushOutcome::Late);
    }

    #[test]
    fn test_wraparound() {
        let mut buffer = JitterBuffer::new(10, 10);
        buffer.push(packet(65_534));
        buffer.push(packet(0));
        buffer.push(packet(65_535));
        buffer.push(packet(1));
        assert_eq!(sequences(&buffer.drain()), vec![65_534, 65_535, 0, 1]);
    }

    #[test]
    fn test_large_jump_resynchronizes() {
        let mut buffer = JitterBuffer::new(10, 10);
        buffer.push(packet(100));
        buffer.push(packet(102));
        buffer.drain();

        assert_eq!(buffer.push(packet(20_000)), PushOutcome::Resynchronized);
        assert_eq!(sequences(&buffer.drain()), vec![20_000]);
        let stats = buffer.stats();
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.packets_lost, 1);
    }

    #[test]
    fn test_flush_skips_gaps() {
        let mut buffer = JitterBuffer::new(10, 10);
        buffer.push(packet(1));
        buffer.push(packet(3));
        buffer.push(packet(6));
        assert_eq!(sequences(&buffer.flush()), vec![1, 3, 6]);
        assert_eq!(buffer.stats().packets_lost, 3);
    }

    proptest! {
        #[test]
        fn prop_never_emits_outside_window(
            base in any::<u16>(),
            offsets in prop::collection::vec(0u16..300, 1..200),
            window in 1u32..40,
            max_delay in 0u32..40,
        ) {
            let mut buffer = JitterBuffer::new(window, max_delay);
            let mut newest: Option<u16> = None;
            let mut emitted: Vec<u16> = Vec::new();
            let mut accepted = std::collections::HashSet::new();

            for offset in offsets {
                let outcome = buffer.push(packet(base.wrapping_add(offset)));
                if let Some(newest) = newest {
                    if newest > offset && newest - offset > window as u16 {
                        prop_assert_eq!(outcome, PushOutcome::Late);
                    }
                }
                if outcome == PushOutcome::Accepted {
                    if let Some(newest) = newest {
                        prop_assert!(newest.saturating_sub(offset) <= window as u16);
                    }
                    accepted.insert(offset);
                }
                newest = Some(newest.map_or(offset, |n| n.max(offset)));

                for out in buffer.drain() {
                    emitted.push(out.header.sequence_number.wrapping_sub(base));
                }
            }
            for out in buffer.flush() {
                emitted.push(out.header.sequence_number.wrapping_sub(base));
            }

            prop_assert!(emitted.windows(2).all(|pair| pair[0] < pair[1]));
            prop_assert!(emitted.iter().all(|offset| accepted.contains(offset)));
        }
    }
}
