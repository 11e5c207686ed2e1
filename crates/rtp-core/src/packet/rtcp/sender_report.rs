use bytes::{Buf, BufMut, BytesMut};

use super::ntp::NtpTimestamp;
use super::report_block::RtcpReportBlock;
use crate::error::Error;
use crate::{Result, RtpSsrc, RtpTimestamp};

/// RTCP Sender Report (SR) packet
/// Defined in RFC 3550 Section 6.4.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSenderReport {
    /// SSRC of the sender
    pub ssrc: RtpSsrc,

    /// Wall-clock time when the report was sent
    pub ntp_timestamp: NtpTimestamp,

    /// RTP timestamp corresponding to the NTP timestamp
    pub rtp_timestamp: RtpTimestamp,

    /// Packets sent since the stream started
    pub sender_packet_count: u32,

    /// Payload octets sent since the stream started
    pub sender_octet_count: u32,

    /// Report blocks for the sources this sender also receives
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpSenderReport {
    /// Create a sender report with no report blocks
    pub fn new(ssrc: RtpSsrc, ntp_timestamp: NtpTimestamp, rtp_timestamp: RtpTimestamp) -> Self {
        Self {
            ssrc,
            ntp_timestamp,
            rtp_timestamp,
            sender_packet_count: 0,
            sender_octet_count: 0,
            report_blocks: Vec::new(),
        }
    }

    /// Body size in bytes, without the common header
    pub fn size(&self) -> usize {
        24 + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    /// Serialize the body
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.size());
        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp_timestamp.seconds);
        buf.put_u32(self.ntp_timestamp.fraction);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.sender_packet_count);
        buf.put_u32(self.sender_octet_count);
        for block in &self.report_blocks {
            block.serialize(buf)?;
        }
        Ok(())
    }
}

/// Parse a sender report body
pub fn parse_sender_report(buf: &mut impl Buf, report_count: u8) -> Result<RtcpSenderReport> {
    if buf.remaining() < 24 {
        return Err(Error::BufferTooSmall {
            required: 24,
            available: buf.remaining(),
        });
    }

    let ssrc = buf.get_u32();
    let ntp_timestamp = NtpTimestamp {
        seconds: buf.get_u32(),
        fraction: buf.get_u32(),
    };
    let rtp_timestamp = buf.get_u32();
    let sender_packet_count = buf.get_u32();
    let sender_octet_count = buf.get_u32();

    let report_blocks = (0..report_count)
        .map(|_| RtcpReportBlock::parse(buf))
        .collect::<Result<Vec<_>>>()?;

    Ok(RtcpSenderReport {
        ssrc,
        ntp_timestamp,
        rtp_timestamp,
        sender_packet_count,
        sender_octet_count,
        report_blocks,
    })
}
