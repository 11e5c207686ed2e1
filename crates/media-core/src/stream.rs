//! Per media line stream state

use std::time::Instant;

use rtp_core::{NtpTimestamp, RtcpReportBlock, RtcpSenderReport, RtpPacket, RtpSequenceNumber, RtpSsrc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{Codec, MediaKind};
use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::events::StreamStats;
use crate::jitter_buffer::{JitterBuffer, PushOutcome};
use crate::packetizer::{Depacketizer, MediaFrame, Packetizer};
use crate::stats::{ReceiverStats, SenderStats};

/// Negotiated parameters of one media line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Media line identifier (`a=mid`)
    pub mid: String,
    pub kind: MediaKind,
    /// Selected codec
    pub codec: Codec,
    /// SSRC this side sends with
    pub local_ssrc: RtpSsrc,
    /// SSRC announced by the peer; latched from the first packet when absent
    pub remote_ssrc: Option<RtpSsrc>,
    pub send: bool,
    pub receive: bool,
}

/// Outcome of feeding one received packet
#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    pub frames: Vec<MediaFrame>,
    /// Sequence number and running total when the packet was late
    pub late: Option<(RtpSequenceNumber, u64)>,
}

#[derive(Debug)]
struct ReceiveSide {
    ssrc: RtpSsrc,
    jitter: JitterBuffer,
    depacketizer: Depacketizer,
    stats: ReceiverStats,
}

impl ReceiveSide {
    fn new(ssrc: RtpSsrc, config: &StreamConfig, media: &MediaConfig) -> Self {
        Self {
            ssrc,
            jitter: JitterBuffer::new(media.window_packets, media.max_delay_packets),
            depacketizer: Depacketizer::for_kind(config.kind),
            stats: ReceiverStats::new(ssrc, config.codec.clock_rate),
        }
    }
}

/// Packetization and reception state of one media line
#[derive(Debug)]
pub struct MediaStream {
    config: StreamConfig,
    media: MediaConfig,
    packetizer: Packetizer,
    sender: SenderStats,
    receiver: Option<ReceiveSide>,
}

impl MediaStream {
    pub fn new(config: StreamConfig, media: &MediaConfig) -> Result<Self> {
        let packetizer = Packetizer::new(config.local_ssrc, config.codec.payload_type, media.mtu)?;
        let sender = SenderStats::new(config.local_ssrc, config.codec.clock_rate);
        let receiver = config.remote_ssrc.map(|ssrc| ReceiveSide::new(ssrc, &config, media));
        Ok(Self {
            config,
            media: media.clone(),
            packetizer,
            sender,
            receiver,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn mid(&self) -> &str {
        &self.config.mid
    }

    pub fn local_ssrc(&self) -> RtpSsrc {
        self.config.local_ssrc
    }

    /// SSRC packets are currently accepted from
    pub fn remote_ssrc(&self) -> Option<RtpSsrc> {
        self.receiver.as_ref().map(|r| r.ssrc).or(self.config.remote_ssrc)
    }

    /// Whether a packet with this SSRC and payload type belongs here. A
    /// stream without a known remote SSRC claims packets of its payload type.
    pub fn accepts(&self, ssrc: RtpSsrc, payload_type: u8) -> bool {
        if !self.config.receive {
            return false;
        }
        match self.remote_ssrc() {
            Some(remote) => remote == ssrc,
            None => payload_type == self.config.codec.payload_type,
        }
    }

    /// Apply a renegotiated configuration for the same media line
    pub fn reconfigure(&mut self, config: StreamConfig) -> Result<()> {
        if config.local_ssrc != self.config.local_ssrc {
            // A new SSRC is a new RTP source with its own sequence space
            self.packetizer = Packetizer::new(config.local_ssrc, config.codec.payload_type, self.media.mtu)?;
            self.sender = SenderStats::new(config.local_ssrc, config.codec.clock_rate);
        } else if config.codec.payload_type != self.config.codec.payload_type {
            self.packetizer.set_payload_type(config.codec.payload_type);
        }
        let remote_changed = config.remote_ssrc.is_some() && config.remote_ssrc != self.remote_ssrc();
        if remote_changed || config.codec.clock_rate != self.config.codec.clock_rate {
            debug!(mid = %config.mid, "Receive side reset by renegotiation");
            self.receiver = None;
        }
        self.config = config;
        Ok(())
    }

    /// Packetize a frame for sending
    pub fn packetize(&mut self, frame: &MediaFrame, now: Instant) -> Result<Vec<RtpPacket>> {
        if !self.config.send {
            return Err(Error::NotSending(self.config.local_ssrc));
        }
        let packets = self.packetizer.packetize(frame);
        self.sender
            .on_frame_sent(frame.timestamp, packets.len(), frame.payload.len(), now);
        Ok(packets)
    }

    /// Feed a received packet through statistics, jitter buffer and
    /// reassembly
    pub fn receive(&mut self, packet: RtpPacket, arrival: Instant) -> ReceiveOutcome {
        let ssrc = packet.header.ssrc;
        let (config, media) = (&self.config, &self.media);
        let receiver = self
            .receiver
            .get_or_insert_with(|| ReceiveSide::new(ssrc, config, media));

        receiver.stats.on_packet(
            packet.header.sequence_number,
            packet.header.timestamp,
            packet.payload.len(),
            arrival,
        );

        let sequence_number = packet.header.sequence_number;
        let mut outcome = ReceiveOutcome::default();
        match receiver.jitter.push(packet) {
            PushOutcome::Late => {
                outcome.late = Some((sequence_number, receiver.jitter.stats().packets_late));
                return outcome;
            }
            PushOutcome::Duplicate => return outcome,
            PushOutcome::Resynchronized => receiver.depacketizer.reset(),
            PushOutcome::Accepted => {}
        }

        for ready in receiver.jitter.drain() {
            if let Some(frame) = receiver.depacketizer.push(&ready) {
                outcome.frames.push(frame);
            }
        }
        outcome
    }

    pub fn on_sender_report(&mut self, report: &RtcpSenderReport, arrival: Instant) {
        if let Some(receiver) = self.receiver.as_mut() {
            if receiver.ssrc == report.ssrc {
                receiver.stats.on_sender_report(report, arrival);
            }
        }
    }

    /// Reception report for the remote source, once anything was received
    pub fn report_block(&mut self, now: Instant) -> Option<RtcpReportBlock> {
        self.receiver
            .as_mut()
            .filter(|r| r.stats.expected() > 0)
            .map(|r| r.stats.report_block(now))
    }

    /// Sender report, once anything was sent
    pub fn sender_report(&self, now: Instant, ntp: NtpTimestamp) -> Option<RtcpSenderReport> {
        self.sender
            .has_sent()
            .then(|| self.sender.sender_report(now, ntp))
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            mid: self.config.mid.clone(),
            local_ssrc: self.config.local_ssrc,
            remote_ssrc: self.remote_ssrc(),
            send: self.sender.has_sent().then(|| self.sender.snapshot()),
            receive: self.receiver.as_ref().map(|r| r.stats.snapshot()),
            jitter_buffer: self.receiver.as_ref().map(|r| r.jitter.stats()),
            frames_received: self
                .receiver
                .as_ref()
                .map_or(0, |r| r.depacketizer.frames_completed()),
            incomplete_frames: self
                .receiver
                .as_ref()
                .map_or(0, |r| r.depacketizer.incomplete_frames()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn audio_config() -> StreamConfig {
        StreamConfig {
            mid: "0".into(),
            kind: MediaKind::Audio,
            codec: Codec::opus(),
            local_ssrc: 0x1111,
            remote_ssrc: None,
            send: true,
            receive: true,
        }
    }

    fn rtp(ssrc: u32, seq: u16) -> RtpPacket {
        let mut packet = RtpPacket::new_with_payload(111, seq, seq as u32 * 960, ssrc, Bytes::from_static(b"opus"));
        packet.header.marker = true;
        packet
    }

    #[test]
    fn test_latches_remote_ssrc() {
        let mut stream = MediaStream::new(audio_config(), &MediaConfig::default()).unwrap();
        assert!(stream.accepts(0x2222, 111));
        assert!(!stream.accepts(0x2222, 0));
        assert!(stream.report_block(Instant::now()).is_none());

        let outcome = stream.receive(rtp(0x2222, 5), Instant::now());
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(stream.remote_ssrc(), Some(0x2222));
        assert!(!stream.accepts(0x3333, 111));
        assert!(stream.report_block(Instant::now()).is_some());
    }

    #[test]
    fn test_receive_only_stream_refuses_to_send() {
        let config = StreamConfig {
            send: false,
            ..audio_config()
        };
        let mut stream = MediaStream::new(config, &MediaConfig::default()).unwrap();
        let err = stream
            .packetize(&MediaFrame::new(0, Bytes::from_static(b"x")), Instant::now())
            .unwrap_err();
        assert!(matches!(err, Error::NotSending(0x1111)));
        assert!(stream.sender_report(Instant::now(), NtpTimestamp::now()).is_none());
    }

    #[test]
    fn test_late_packet_reported() {
        let media = MediaConfig::default().with_jitter_window(4, 1);
        let mut stream = MediaStream::new(audio_config(), &media).unwrap();
        let now = Instant::now();

        stream.receive(rtp(0x2222, 100), now);
        let outcome = stream.receive(rtp(0x2222, 110), now);
        assert_eq!(outcome.frames.len(), 1);

        let outcome = stream.receive(rtp(0x2222, 101), now);
        assert_eq!(outcome.late, Some((101, 1)));
        assert!(outcome.frames.is_empty());

        let stats = stream.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.jitter_buffer.unwrap().packets_late, 1);
        assert_eq!(stats.receive.unwrap().packets_received, 3);
    }

    #[test]
    fn test_reconfigure_changes_payload_type_and_remote() {
        let mut stream = MediaStream::new(audio_config(), &MediaConfig::default()).unwrap();
        stream.receive(rtp(0x2222, 1), Instant::now());

        let updated = StreamConfig {
            codec: Codec::new(109, "opus", 48_000, 2),
            remote_ssrc: Some(0x4444),
            ..audio_config()
        };
        stream.reconfigure(updated).unwrap();
        assert_eq!(stream.remote_ssrc(), Some(0x4444));

        let packets = stream
            .packetize(&MediaFrame::new(0, Bytes::from_static(b"x")), Instant::now())
            .unwrap();
        assert_eq!(packets[0].header.payload_type, 109);
        assert_eq!(packets[0].header.ssrc, 0x1111);
    }
}
