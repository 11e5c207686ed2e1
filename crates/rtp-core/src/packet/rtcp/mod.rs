//! RTCP Packet module
//!
//! Sender and receiver reports (RFC 3550) and receiver-estimated maximum
//! bitrate feedback, the subset the media pipeline's feedback loop uses.
//! Other packet types in a compound packet are skipped on parse.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::Error;
use crate::Result;

mod ntp;
mod receiver_report;
mod remb;
mod report_block;
mod sender_report;

pub use ntp::{compact_to_duration, duration_to_compact, NtpTimestamp};
pub use receiver_report::RtcpReceiverReport;
pub use remb::{RtcpRemb, REMB_FMT};
pub use report_block::RtcpReportBlock;
pub use sender_report::RtcpSenderReport;

/// RTCP version (same as RTP, always 2)
pub const RTCP_VERSION: u8 = 2;

/// Size of the common RTCP header
pub const RTCP_HEADER_SIZE: usize = 4;

/// RTCP packet types used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    /// Sender Report (SR)
    SenderReport = 200,

    /// Receiver Report (RR)
    ReceiverReport = 201,

    /// Payload-specific feedback (RFC 4585)
    PayloadSpecificFeedback = 206,
}

impl TryFrom<u8> for RtcpPacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            200 => Ok(RtcpPacketType::SenderReport),
            201 => Ok(RtcpPacketType::ReceiverReport),
            206 => Ok(RtcpPacketType::PayloadSpecificFeedback),
            _ => Err(Error::RtcpError(format!("Unsupported RTCP packet type: {}", value))),
        }
    }
}

/// RTCP packet variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    /// Sender Report (SR)
    SenderReport(RtcpSenderReport),

    /// Receiver Report (RR)
    ReceiverReport(RtcpReceiverReport),

    /// Receiver-estimated maximum bitrate
    Remb(RtcpRemb),
}

impl RtcpPacket {
    /// Parse a compound RTCP packet, skipping packet types the engine does
    /// not consume
    pub fn parse_compound(data: &[u8]) -> Result<Vec<Self>> {
        let mut buf = Bytes::copy_from_slice(data);
        let mut packets = Vec::new();

        while buf.has_remaining() {
            if buf.remaining() < RTCP_HEADER_SIZE {
                return Err(Error::BufferTooSmall {
                    required: RTCP_HEADER_SIZE,
                    available: buf.remaining(),
                });
            }

            let first_byte = buf.get_u8();
            let version = first_byte >> 6;
            if version != RTCP_VERSION {
                return Err(Error::RtcpError(format!("Invalid RTCP version: {}", version)));
            }
            let count = first_byte & 0x1F;
            let packet_type = buf.get_u8();
            let length = buf.get_u16() as usize * 4;
            if buf.remaining() < length {
                return Err(Error::BufferTooSmall {
                    required: length,
                    available: buf.remaining(),
                });
            }
            let mut body = buf.split_to(length);

            match RtcpPacketType::try_from(packet_type) {
                Ok(RtcpPacketType::SenderReport) => {
                    packets.push(RtcpPacket::SenderReport(sender_report::parse_sender_report(&mut body, count)?));
                }
                Ok(RtcpPacketType::ReceiverReport) => {
                    packets.push(RtcpPacket::ReceiverReport(receiver_report::parse_receiver_report(
                        &mut body, count,
                    )?));
                }
                Ok(RtcpPacketType::PayloadSpecificFeedback) if count == REMB_FMT => {
                    if let Some(remb) = remb::parse_remb(&mut body)? {
                        packets.push(RtcpPacket::Remb(remb));
                    }
                }
                _ => trace!("Skipping RTCP packet type {} ({} bytes)", packet_type, length),
            }
        }

        if packets.is_empty() && data.is_empty() {
            return Err(Error::RtcpError("Empty RTCP packet".into()));
        }
        Ok(packets)
    }

    /// Serialize one packet with its common header
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Serialize several packets back to back into one compound packet
    pub fn serialize_compound(packets: &[RtcpPacket]) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        for packet in packets {
            packet.serialize_into(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    fn serialize_into(&self, buf: &mut BytesMut) -> Result<()> {
        let (count, packet_type, body_size) = match self {
            RtcpPacket::SenderReport(sr) => (sr.report_blocks.len(), RtcpPacketType::SenderReport, sr.size()),
            RtcpPacket::ReceiverReport(rr) => (rr.report_blocks.len(), RtcpPacketType::ReceiverReport, rr.size()),
            RtcpPacket::Remb(remb) => (REMB_FMT as usize, RtcpPacketType::PayloadSpecificFeedback, remb.size()),
        };
        if count > 31 {
            return Err(Error::EncodeError(format!("Too many report blocks: {}", count)));
        }

        buf.reserve(RTCP_HEADER_SIZE + body_size);
        buf.put_u8((RTCP_VERSION << 6) | count as u8);
        buf.put_u8(packet_type as u8);
        buf.put_u16((body_size / 4) as u16);

        match self {
            RtcpPacket::SenderReport(sr) => sr.serialize(buf),
            RtcpPacket::ReceiverReport(rr) => rr.serialize(buf),
            RtcpPacket::Remb(remb) => remb.serialize(buf),
        }
    }
}
