use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version
pub const RTP_VERSION: u8 = 2;

/// Size of the fixed RTP header
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// Header extension carried after the CSRC list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeaderExtension {
    /// Profile-defined identifier
    pub profile: u16,

    /// Extension data, a multiple of four bytes
    pub data: Bytes,
}

/// RTP header as defined in RFC 3550 section 5.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (always 2)
    pub version: u8,

    /// Padding flag
    pub padding: bool,

    /// Extension flag
    pub extension: bool,

    /// CSRC count
    pub cc: u8,

    /// Marker bit
    pub marker: bool,

    /// Payload type
    pub payload_type: u8,

    /// Sequence number
    pub sequence_number: RtpSequenceNumber,

    /// Timestamp
    pub timestamp: RtpTimestamp,

    /// Synchronization source
    pub ssrc: RtpSsrc,

    /// Contributing sources
    pub csrc: Vec<RtpCsrc>,

    /// Header extension, when the extension flag is set
    pub extensions: Option<RtpHeaderExtension>,
}

impl RtpHeader {
    /// Create a new header with no CSRCs or extension
    pub fn new(payload_type: u8, sequence_number: RtpSequenceNumber, timestamp: RtpTimestamp, ssrc: RtpSsrc) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            cc: 0,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extensions: None,
        }
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        let ext = self
            .extensions
            .as_ref()
            .map(|e| 4 + e.data.len())
            .unwrap_or(0);
        RTP_MIN_HEADER_SIZE + self.csrc.len() * 4 + ext
    }

    /// Parse a header, leaving `buf` at the start of the payload
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let first_byte = buf.get_u8();
        let version = first_byte >> 6;
        if version != RTP_VERSION {
            return Err(Error::InvalidPacket(format!("Invalid RTP version: {}", version)));
        }
        let padding = (first_byte >> 5) & 0x01 == 1;
        let extension = (first_byte >> 4) & 0x01 == 1;
        let cc = first_byte & 0x0F;

        let second_byte = buf.get_u8();
        let marker = second_byte >> 7 == 1;
        let payload_type = second_byte & 0x7F;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let csrc_len = cc as usize * 4;
        if buf.remaining() < csrc_len {
            return Err(Error::BufferTooSmall {
                required: csrc_len,
                available: buf.remaining(),
            });
        }
        let csrc = (0..cc).map(|_| buf.get_u32()).collect();

        let extensions = if extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            let profile = buf.get_u16();
            let length = buf.get_u16() as usize * 4;
            if buf.remaining() < length {
                return Err(Error::BufferTooSmall {
                    required: length,
                    available: buf.remaining(),
                });
            }
            Some(RtpHeaderExtension {
                profile,
                data: buf.copy_to_bytes(length),
            })
        } else {
            None
        };

        Ok(Self {
            version,
            padding,
            extension,
            cc,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extensions,
        })
    }

    /// Serialize the header
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.csrc.len() > 15 {
            return Err(Error::EncodeError(format!("Too many CSRCs: {}", self.csrc.len())));
        }
        if let Some(ext) = &self.extensions {
            if ext.data.len() % 4 != 0 {
                return Err(Error::EncodeError("Header extension is not 32-bit aligned".into()));
            }
        }
        buf.reserve(self.size());

        let mut first_byte = RTP_VERSION << 6;
        if self.padding {
            first_byte |= 0x20;
        }
        if self.extensions.is_some() {
            first_byte |= 0x10;
        }
        first_byte |= self.csrc.len() as u8;
        buf.put_u8(first_byte);

        let mut second_byte = self.payload_type & 0x7F;
        if self.marker {
            second_byte |= 0x80;
        }
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if let Some(ext) = &self.extensions {
            buf.put_u16(ext.profile);
            buf.put_u16((ext.data.len() / 4) as u16);
            buf.put_slice(&ext.data);
        }
        Ok(())
    }
}

/// RTP packet: header plus payload, padding removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Packet header
    pub header: RtpHeader,

    /// Payload data
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a packet from a header and payload
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Create a packet with a plain header
    pub fn new_with_payload(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
        payload: Bytes,
    ) -> Self {
        Self::new(RtpHeader::new(payload_type, sequence_number, timestamp, ssrc), payload)
    }

    /// Parse a packet, stripping any padding
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        let header = RtpHeader::parse(&mut buf)?;

        let mut payload = buf;
        if header.padding {
            let pad = payload.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > payload.len() {
                return Err(Error::InvalidPacket(format!("Invalid padding length {}", pad)));
            }
            payload.truncate(payload.len() - pad);
        }

        Ok(Self { header, payload })
    }

    /// Serialize the packet; padding is never emitted
    pub fn serialize(&self) -> Result<Bytes> {
        let mut header = self.header.clone();
        header.padding = false;

        let mut buf = BytesMut::with_capacity(self.size());
        header.serialize(&mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_header_serialize_parse() {
        let original = RtpHeader::new(96, 1000, 0x12345678, 0xabcdef01);
        let mut buf = BytesMut::with_capacity(12);
        original.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), 12);

        let mut reader = buf.freeze();
        let parsed = tokio_test::assert_ok!(RtpHeader::parse(&mut reader));
        assert_eq!(parsed, original);

        let mut truncated = Bytes::from_static(&[0x80, 96, 0, 1]);
        tokio_test::assert_err!(RtpHeader::parse(&mut truncated));
    }

    #[test]
    fn test_csrc_and_extension_are_skipped_to_payload() {
        let mut header = RtpHeader::new(111, 7, 960, 0x11223344);
        header.csrc = vec![1, 2];
        header.extensions = Some(RtpHeaderExtension {
            profile: 0xBEDE,
            data: Bytes::from_static(&[0x10, 0xAA, 0, 0]),
        });
        header.marker = true;
        let packet = RtpPacket::new(header, Bytes::from_static(b"opus"));

        let wire = packet.serialize().unwrap();
        assert_eq!(wire.len(), 12 + 8 + 8 + 4);

        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.header.cc, 2);
        assert!(parsed.header.marker);
        assert_eq!(parsed.header.extensions.as_ref().unwrap().profile, 0xBEDE);
        assert_eq!(&parsed.payload[..], b"opus");
    }

    #[test]
    fn test_padding_is_removed() {
        let mut wire = BytesMut::new();
        let mut header = RtpHeader::new(96, 1, 0, 5);
        header.padding = true;
        header.serialize(&mut wire).unwrap();
        wire.put_slice(b"abc");
        wire.put_slice(&[0, 0, 3]);

        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(&parsed.payload[..], b"abc");

        // Padding count larger than the payload
        let mut bad = wire.clone();
        let last = bad.len() - 1;
        bad[last] = 200;
        assert!(RtpPacket::parse(&bad).is_err());
    }

    #[test]
    fn test_truncated_and_wrong_version() {
        assert!(matches!(
            RtpPacket::parse(&[0x80, 96, 0]),
            Err(Error::BufferTooSmall { required: 12, .. })
        ));

        let mut wire = RtpPacket::new_with_payload(96, 1, 0, 5, Bytes::new())
            .serialize()
            .unwrap()
            .to_vec();
        wire[0] = 0x40;
        assert!(matches!(RtpPacket::parse(&wire), Err(Error::InvalidPacket(_))));

        // CSRC count promising more than is present
        let mut short = RtpPacket::new_with_payload(96, 1, 0, 5, Bytes::new())
            .serialize()
            .unwrap()
            .to_vec();
        short[0] |= 0x03;
        assert!(RtpPacket::parse(&short).is_err());
    }
}
