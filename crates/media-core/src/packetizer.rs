//! Frame packetization and reassembly
//!
//! A frame is an opaque encoded unit (one Opus packet, one video frame) with
//! an RTP timestamp. The packetizer splits it into MTU sized payloads that
//! share the timestamp; the last packet of the frame carries the marker bit.
//! The depacketizer reverses this for packets handed over in sequence order
//! by the jitter buffer. A frame with a missing packet is dropped: nothing is
//! retransmitted at this layer.

use bytes::{Bytes, BytesMut};
use rand::Rng;
use rtp_core::{RtpPacket, RtpSequenceNumber, RtpSsrc, RtpTimestamp};
use tracing::trace;

use crate::codec::MediaKind;
use crate::error::{Error, Result};

/// An encoded media frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// RTP timestamp in codec clock units
    pub timestamp: RtpTimestamp,

    /// Encoded payload
    pub payload: Bytes,
}

impl MediaFrame {
    pub fn new(timestamp: RtpTimestamp, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }
}

/// Splits frames into RTP packets for one SSRC
#[derive(Debug, Clone)]
pub struct Packetizer {
    ssrc: RtpSsrc,
    payload_type: u8,
    mtu: usize,
    /// Sequence number of the next packet
    sequence_number: RtpSequenceNumber,
    last_timestamp: Option<RtpTimestamp>,
}

impl Packetizer {
    /// Create a packetizer starting at a random sequence number (RFC 3550
    /// section 5.1)
    pub fn new(ssrc: RtpSsrc, payload_type: u8, mtu: usize) -> Result<Self> {
        let initial = rand::thread_rng().gen_range(0..=u16::MAX);
        Self::with_initial_sequence(ssrc, payload_type, mtu, initial)
    }

    pub fn with_initial_sequence(
        ssrc: RtpSsrc,
        payload_type: u8,
        mtu: usize,
        initial_sequence: RtpSequenceNumber,
    ) -> Result<Self> {
        if mtu == 0 {
            return Err(Error::InvalidParameter("mtu must be positive".into()));
        }
        Ok(Self {
            ssrc,
            payload_type,
            mtu,
            sequence_number: initial_sequence,
            last_timestamp: None,
        })
    }

    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    /// Switch the payload type after a renegotiation changed the codec
    pub fn set_payload_type(&mut self, payload_type: u8) {
        self.payload_type = payload_type;
    }

    /// Sequence number the next packet will carry
    pub fn next_sequence_number(&self) -> RtpSequenceNumber {
        self.sequence_number
    }

    pub fn last_timestamp(&self) -> Option<RtpTimestamp> {
        self.last_timestamp
    }

    /// Split a frame into packets. An empty frame still produces one packet
    /// so the receiver sees the frame boundary.
    pub fn packetize(&mut self, frame: &MediaFrame) -> Vec<RtpPacket> {
        let chunks: Vec<Bytes> = if frame.payload.is_empty() {
            vec![Bytes::new()]
        } else {
            (0..frame.payload.len())
                .step_by(self.mtu)
                .map(|start| frame.payload.slice(start..(start + self.mtu).min(frame.payload.len())))
                .collect()
        };

        let count = chunks.len();
        let mut packets = Vec::with_capacity(count);
        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut packet = RtpPacket::new_with_payload(
                self.payload_type,
                self.sequence_number,
                frame.timestamp,
                self.ssrc,
                chunk,
            );
            packet.header.marker = index + 1 == count;

            self.sequence_number = self.sequence_number.wrapping_add(1);
            packets.push(packet);
        }

        self.last_timestamp = Some(frame.timestamp);
        trace!(
            ssrc = self.ssrc,
            timestamp = frame.timestamp,
            packets = count,
            "Packetized frame of {} bytes",
            frame.payload.len()
        );
        packets
    }
}

/// In-progress frame reassembly
#[derive(Debug)]
struct Assembly {
    timestamp: RtpTimestamp,
    next_sequence: RtpSequenceNumber,
    payload: BytesMut,
    broken: bool,
}

/// Rebuilds frames from in-order packets of one SSRC
#[derive(Debug, Default)]
pub struct Depacketizer {
    current: Option<Assembly>,
    last_sequence: Option<RtpSequenceNumber>,
    /// Every frame fits one packet, so a gap never eats the start of a frame
    single_packet_frames: bool,
    frames_completed: u64,
    incomplete_frames: u64,
}

impl Depacketizer {
    /// Depacketizer for frames that may span several packets
    pub fn new() -> Self {
        Self::default()
    }

    /// Audio codecs put each frame in a single packet
    pub fn for_kind(kind: MediaKind) -> Self {
        Self {
            single_packet_frames: kind == MediaKind::Audio,
            ..Self::default()
        }
    }

    /// Frames handed out so far
    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    /// Frames discarded because one of their packets never arrived
    pub fn incomplete_frames(&self) -> u64 {
        self.incomplete_frames
    }

    /// Feed the next packet in sequence order. Returns a frame when the
    /// packet completes one.
    pub fn push(&mut self, packet: &RtpPacket) -> Option<MediaFrame> {
        let header = &packet.header;
        let contiguous = self
            .last_sequence
            .map_or(true, |last| last.wrapping_add(1) == header.sequence_number);
        self.last_sequence = Some(header.sequence_number);

        let continues_current = matches!(
            &self.current,
            Some(assembly) if assembly.timestamp == header.timestamp
        );

        if !continues_current {
            if let Some(stale) = self.current.take() {
                // New timestamp before the marker of the previous frame
                trace!(timestamp = stale.timestamp, "Dropping frame without marker");
                self.incomplete_frames += 1;
            }
            self.current = Some(Assembly {
                timestamp: header.timestamp,
                next_sequence: header.sequence_number,
                payload: BytesMut::new(),
                // A gap right before the first packet may have eaten the
                // start of this frame
                broken: !contiguous && !self.single_packet_frames,
            });
        }

        let assembly = self.current.as_mut()?;
        if assembly.next_sequence != header.sequence_number {
            assembly.broken = true;
        }
        assembly.next_sequence = header.sequence_number.wrapping_add(1);
        assembly.payload.extend_from_slice(&packet.payload);

        if !header.marker {
            return None;
        }

        let finished = self.current.take()?;
        if finished.broken {
            trace!(timestamp = finished.timestamp, "Dropping frame with a sequence gap");
            self.incomplete_frames += 1;
            return None;
        }
        self.frames_completed += 1;
        Some(MediaFrame {
            timestamp: finished.timestamp,
            payload: finished.payload.freeze(),
        })
    }

    /// Forget any partial frame, e.g. after the jitter buffer resynchronized
    pub fn reset(&mut self) {
        if self.current.take().is_some() {
            self.incomplete_frames += 1;
        }
        self.last_sequence = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(timestamp: u32, len: usize) -> MediaFrame {
        MediaFrame::new(timestamp, (0..len).map(|i| i as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_split_shares_timestamp_and_marks_last() {
        let mut packetizer = Packetizer::with_initial_sequence(0xABCD, 96, 100, 10).unwrap();
        let packets = packetizer.packetize(&frame(3000, 250));

        assert_eq!(packets.len(), 3);
        assert_eq!(packets.iter().map(|p| p.payload.len()).collect::<Vec<_>>(), vec![100, 100, 50]);
        assert!(packets.iter().all(|p| p.header.timestamp == 3000 && p.header.ssrc == 0xABCD));
        assert_eq!(packets.iter().map(|p| p.header.marker).collect::<Vec<_>>(), vec![false, false, true]);
        assert_eq!(
            packets.iter().map(|p| p.header.sequence_number).collect::<Vec<_>>(),
            vec![10, 11, 12]
        );
        assert_eq!(packetizer.next_sequence_number(), 13);
        assert_eq!(packetizer.last_timestamp(), Some(3000));
    }

    #[test]
    fn test_sequence_wraps_across_frames() {
        let mut packetizer = Packetizer::with_initial_sequence(1, 111, 10, 65534).unwrap();
        let first = packetizer.packetize(&frame(0, 20));
        let second = packetizer.packetize(&frame(960, 5));

        assert_eq!(first[0].header.sequence_number, 65534);
        assert_eq!(first[1].header.sequence_number, 65535);
        assert_eq!(second[0].header.sequence_number, 0);
        assert!(second[0].header.marker);
        assert_eq!(packetizer.next_sequence_number(), 1);
    }

    #[test]
    fn test_empty_frame_and_zero_mtu() {
        let mut packetizer = Packetizer::with_initial_sequence(1, 0, 160, 0).unwrap();
        let packets = packetizer.packetize(&MediaFrame::new(0, Bytes::new()));
        assert_eq!(packets.len(), 1);
        assert!(packets[0].header.marker);

        assert!(Packetizer::new(1, 0, 0).is_err());
    }

    #[test]
    fn test_reassembles_across_wrap() {
        let mut packetizer = Packetizer::with_initial_sequence(7, 96, 64, 65533).unwrap();
        let mut depacketizer = Depacketizer::new();

        let original = frame(90_000, 300);
        let packets = packetizer.packetize(&original);
        let mut out = Vec::new();
        for packet in &packets {
            out.extend(depacketizer.push(packet));
        }

        assert_eq!(out, vec![original]);
        assert_eq!(depacketizer.frames_completed(), 1);
        assert_eq!(depacketizer.incomplete_frames(), 0);
    }

    #[test]
    fn test_gap_discards_frame() {
        let mut packetizer = Packetizer::with_initial_sequence(7, 96, 10, 100).unwrap();
        let mut depacketizer = Depacketizer::new();

        let first = packetizer.packetize(&frame(0, 30));
        let second = packetizer.packetize(&frame(3000, 30));
        let third = packetizer.packetize(&frame(6000, 10));

        // Middle packet of the first frame is lost
        assert!(depacketizer.push(&first[0]).is_none());
        assert!(depacketizer.push(&first[2]).is_none());
        // Second frame arrives whole
        let mut out = Vec::new();
        for packet in &second {
            out.extend(depacketizer.push(packet));
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp, 3000);

        // Later frames are unaffected by the earlier loss
        assert!(depacketizer.push(&third[0]).is_some());
        assert_eq!(depacketizer.incomplete_frames(), 1);
    }

    #[test]
    fn test_audio_frames_survive_gaps() {
        let mut packetizer = Packetizer::with_initial_sequence(7, 111, 1200, 0).unwrap();
        let mut depacketizer = Depacketizer::for_kind(MediaKind::Audio);

        let first = packetizer.packetize(&frame(0, 80));
        let _lost = packetizer.packetize(&frame(960, 80));
        let third = packetizer.packetize(&frame(1920, 80));

        assert!(depacketizer.push(&first[0]).is_some());
        assert_eq!(depacketizer.push(&third[0]).map(|f| f.timestamp), Some(1920));
        assert_eq!(depacketizer.incomplete_frames(), 0);
    }

    #[test]
    fn test_lost_marker_counts_incomplete() {
        let mut packetizer = Packetizer::with_initial_sequence(7, 96, 10, 0).unwrap();
        let mut depacketizer = Depacketizer::new();

        let first = packetizer.packetize(&frame(0, 20));
        let second = packetizer.packetize(&frame(3000, 10));

        assert!(depacketizer.push(&first[0]).is_none());
        // first[1] with the marker is lost, the next frame starts after a gap
        assert!(depacketizer.push(&second[0]).is_none());
        assert_eq!(depacketizer.incomplete_frames(), 2);
        assert_eq!(depacketizer.frames_completed(), 0);
    }
}
