//! DTLS record layer framing (RFC 6347 section 4.1)
//!
//! Records are carried in the clear at epoch 0; the handshake only exists to
//! authenticate the peers and export SRTP keys, and application data never
//! travels over DTLS.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::Result;

/// DTLS 1.2 on the wire
pub const DTLS_VERSION_1_2: u16 = 0xFEFD;

/// DTLS 1.0, accepted in ClientHello record headers
pub const DTLS_VERSION_1_0: u16 = 0xFEFF;

/// Record header length: type, version, epoch, 48-bit sequence, length
pub const RECORD_HEADER_LEN: usize = 13;

/// Whether a datagram looks like DTLS (RFC 7983 demultiplexing)
pub fn is_dtls_record(data: &[u8]) -> bool {
    matches!(data.first(), Some(20..=63))
}

/// DTLS record content type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl TryFrom<u8> for ContentType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            20 => Ok(ContentType::ChangeCipherSpec),
            21 => Ok(ContentType::Alert),
            22 => Ok(ContentType::Handshake),
            23 => Ok(ContentType::ApplicationData),
            other => Err(Error::InvalidPacket(format!("Unknown DTLS content type: {}", other))),
        }
    }
}

/// A single DTLS record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content_type: ContentType,
    pub epoch: u16,
    /// 48-bit record sequence number
    pub sequence_number: u64,
    pub fragment: Bytes,
}

impl Record {
    pub fn new(content_type: ContentType, sequence_number: u64, fragment: Bytes) -> Self {
        Self {
            content_type,
            epoch: 0,
            sequence_number: sequence_number & 0xFFFF_FFFF_FFFF,
            fragment,
        }
    }

    /// Serialize the record into `buf`
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.fragment.len() > u16::MAX as usize {
            return Err(Error::EncodeError(format!(
                "Record fragment too large: {} bytes",
                self.fragment.len()
            )));
        }
        buf.reserve(RECORD_HEADER_LEN + self.fragment.len());
        buf.put_u8(self.content_type as u8);
        buf.put_u16(DTLS_VERSION_1_2);
        buf.put_u16(self.epoch);
        let seq = self.sequence_number.to_be_bytes();
        buf.put_slice(&seq[2..]);
        buf.put_u16(self.fragment.len() as u16);
        buf.put_slice(&self.fragment);
        Ok(())
    }

    /// Parse every record in a datagram
    pub fn parse_all(data: &[u8]) -> Result<Vec<Record>> {
        let mut buf = data;
        let mut records = Vec::new();

        while buf.has_remaining() {
            if buf.remaining() < RECORD_HEADER_LEN {
                return Err(Error::BufferTooSmall {
                    required: RECORD_HEADER_LEN,
                    available: buf.remaining(),
                });
            }
            let content_type = ContentType::try_from(buf.get_u8())?;
            let version = buf.get_u16();
            if version != DTLS_VERSION_1_2 && version != DTLS_VERSION_1_0 {
                return Err(Error::InvalidPacket(format!("Unsupported DTLS version: {:#06x}", version)));
            }
            let epoch = buf.get_u16();
            let sequence_number = buf.get_uint(6);
            let length = buf.get_u16() as usize;
            if buf.remaining() < length {
                return Err(Error::BufferTooSmall { required: length, available: buf.remaining() });
            }
            let fragment = Bytes::copy_from_slice(&buf[..length]);
            buf.advance(length);

            records.push(Record { content_type, epoch, sequence_number, fragment });
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header_layout() {
        let record = Record::new(ContentType::Handshake, 0x0102_0304_0506, Bytes::from_static(b"abc"));
        let mut buf = BytesMut::new();
        record.serialize(&mut buf).unwrap();

        assert_eq!(buf.len(), RECORD_HEADER_LEN + 3);
        assert_eq!(buf[0], 22);
        assert_eq!(&buf[1..3], &[0xFE, 0xFD]);
        assert_eq!(&buf[3..5], &[0, 0]);
        assert_eq!(&buf[5..11], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&buf[11..13], &[0, 3]);
        assert!(is_dtls_record(&buf));
    }

    #[test]
    fn test_multiple_records_in_one_datagram() {
        let mut buf = BytesMut::new();
        Record::new(ContentType::Handshake, 1, Bytes::from_static(b"one"))
            .serialize(&mut buf)
            .unwrap();
        Record::new(ContentType::Alert, 2, Bytes::from_static(&[2, 40]))
            .serialize(&mut buf)
            .unwrap();

        let records = Record::parse_all(&buf).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fragment, Bytes::from_static(b"one"));
        assert_eq!(records[1].content_type, ContentType::Alert);
        assert_eq!(records[1].sequence_number, 2);
    }

    #[test]
    fn test_truncated_and_foreign_datagrams() {
        let mut buf = BytesMut::new();
        Record::new(ContentType::Handshake, 1, Bytes::from_static(b"payload"))
            .serialize(&mut buf)
            .unwrap();
        assert!(Record::parse_all(&buf[..buf.len() - 1]).is_err());
        assert!(Record::parse_all(&buf[..5]).is_err());

        // RTP and STUN are not DTLS
        assert!(!is_dtls_record(&[0x80, 0x60]));
        assert!(!is_dtls_record(&[0x00, 0x01]));
        assert!(!is_dtls_record(&[]));
    }
}
