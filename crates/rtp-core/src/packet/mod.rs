//! RTP Packet module
//!
//! This module provides structures for handling RTP packets as defined in RFC 3550,
//! and the RTCP packets used for reception feedback.

pub mod rtcp;
pub mod rtp;

pub use rtp::*;

/// Whether a datagram on a muxed RTP/RTCP flow is RTCP (RFC 5761 section 4)
pub fn is_rtcp_packet(data: &[u8]) -> bool {
    data.len() >= 8 && (data[0] >> 6) == RTP_VERSION && (192..=223).contains(&data[1])
}

/// Format bytes as hex for trace logs
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_rtcp_demux() {
        let rtp = RtpPacket::new_with_payload(96, 1, 0, 0x1234, Bytes::from_static(b"x"))
            .serialize()
            .unwrap();
        assert!(!is_rtcp_packet(&rtp));

        let rr = rtcp::RtcpPacket::ReceiverReport(rtcp::RtcpReceiverReport::new(0x1234))
            .serialize()
            .unwrap();
        assert!(is_rtcp_packet(&rr));

        // Marker bit set with a dynamic payload type stays RTP
        let mut marked = RtpPacket::new_with_payload(111, 1, 0, 0x1234, Bytes::from_static(b"x"));
        marked.header.marker = true;
        assert!(!is_rtcp_packet(&marked.serialize().unwrap()));
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x80, 0x0a]), "80 0a");
    }
}
