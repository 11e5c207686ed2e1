//! DTLS handshake message types
//!
//! Messages keep the RFC 6347 handshake header (type, 24-bit length,
//! message_seq, fragment offset/length) but carry a condensed body: the
//! hellos bundle the certificate and the ephemeral ECDH key so the whole
//! handshake fits in four flights.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::record::DTLS_VERSION_1_2;
use crate::error::Error;
use crate::Result;

/// Handshake message header length
pub const HANDSHAKE_HEADER_LEN: usize = 12;

/// Length of hello random values
pub const RANDOM_LEN: usize = 32;

/// Length of Finished verify_data
pub const VERIFY_DATA_LEN: usize = 12;

/// DTLS handshake message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    /// ClientHello message (sent by client)
    ClientHello = 1,

    /// ServerHello message (sent by server)
    ServerHello = 2,

    /// CertificateVerify message (sent by client)
    CertificateVerify = 15,

    /// Finished message
    Finished = 20,
}

impl TryFrom<u8> for HandshakeType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(HandshakeType::ClientHello),
            2 => Ok(HandshakeType::ServerHello),
            15 => Ok(HandshakeType::CertificateVerify),
            20 => Ok(HandshakeType::Finished),
            other => Err(Error::InvalidPacket(format!("Unsupported handshake type: {}", other))),
        }
    }
}

/// A framed handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub msg_type: HandshakeType,
    pub message_seq: u16,
    pub body: Bytes,
}

impl HandshakeMessage {
    pub fn new(msg_type: HandshakeType, message_seq: u16, body: Bytes) -> Self {
        Self { msg_type, message_seq, body }
    }

    /// Serialize header and body; the result is also what enters the transcript
    pub fn serialize(&self) -> Bytes {
        let length = self.body.len() as u32;
        let mut buf = BytesMut::with_capacity(HANDSHAKE_HEADER_LEN + self.body.len());
        buf.put_u8(self.msg_type as u8);
        put_u24(&mut buf, length);
        buf.put_u16(self.message_seq);
        // Never fragmented: offset 0, fragment length = length
        put_u24(&mut buf, 0);
        put_u24(&mut buf, length);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse a handshake message from a record fragment
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < HANDSHAKE_HEADER_LEN {
            return Err(Error::BufferTooSmall {
                required: HANDSHAKE_HEADER_LEN,
                available: buf.remaining(),
            });
        }
        let msg_type = HandshakeType::try_from(buf.get_u8())?;
        let length = buf.get_uint(3) as usize;
        let message_seq = buf.get_u16();
        let fragment_offset = buf.get_uint(3) as usize;
        let fragment_length = buf.get_uint(3) as usize;

        if fragment_offset != 0 || fragment_length != length {
            return Err(Error::InvalidPacket("Fragmented handshake messages are not supported".into()));
        }
        if buf.remaining() < length {
            return Err(Error::BufferTooSmall { required: length, available: buf.remaining() });
        }

        Ok(Self {
            msg_type,
            message_seq,
            body: Bytes::copy_from_slice(&buf[..length]),
        })
    }
}

/// ClientHello: random, ephemeral key, certificate and offered SRTP profiles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; RANDOM_LEN],
    /// SEC1 encoded P-256 point
    pub ecdhe_public: Bytes,
    /// DER certificate
    pub certificate: Bytes,
    pub srtp_profiles: Vec<u16>,
}

impl ClientHello {
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u16(DTLS_VERSION_1_2);
        buf.put_slice(&self.random);
        put_vec8(&mut buf, &self.ecdhe_public)?;
        put_vec24(&mut buf, &self.certificate)?;
        let mut profiles = BytesMut::with_capacity(self.srtp_profiles.len() * 2);
        for profile in &self.srtp_profiles {
            profiles.put_u16(*profile);
        }
        put_vec16(&mut buf, &profiles)?;
        Ok(buf.freeze())
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        read_version(&mut buf)?;
        let random = read_random(&mut buf)?;
        let ecdhe_public = get_vec8(&mut buf)?;
        let certificate = get_vec24(&mut buf)?;
        let profile_bytes = get_vec16(&mut buf)?;
        if profile_bytes.len() % 2 != 0 {
            return Err(Error::InvalidPacket("Odd SRTP profile list length".into()));
        }
        let srtp_profiles = profile_bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { random, ecdhe_public, certificate, srtp_profiles })
    }
}

/// ServerHello: random, ephemeral key, certificate, selected profile and a
/// signature over the key exchange parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; RANDOM_LEN],
    pub ecdhe_public: Bytes,
    pub certificate: Bytes,
    pub srtp_profile: u16,
    /// DER ECDSA signature
    pub signature: Bytes,
}

impl ServerHello {
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u16(DTLS_VERSION_1_2);
        buf.put_slice(&self.random);
        put_vec8(&mut buf, &self.ecdhe_public)?;
        put_vec24(&mut buf, &self.certificate)?;
        buf.put_u16(self.srtp_profile);
        put_vec16(&mut buf, &self.signature)?;
        Ok(buf.freeze())
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        read_version(&mut buf)?;
        let random = read_random(&mut buf)?;
        let ecdhe_public = get_vec8(&mut buf)?;
        let certificate = get_vec24(&mut buf)?;
        ensure(&buf, 2)?;
        let srtp_profile = buf.get_u16();
        let signature = get_vec16(&mut buf)?;
        Ok(Self { random, ecdhe_public, certificate, srtp_profile, signature })
    }

    /// Bytes covered by the server signature, as in a TLS 1.2
    /// ServerKeyExchange: client random, server random, ECDH parameters
    pub fn signed_params(client_random: &[u8; RANDOM_LEN], server_random: &[u8; RANDOM_LEN], ecdhe_public: &[u8]) -> Vec<u8> {
        let mut params = Vec::with_capacity(2 * RANDOM_LEN + 1 + ecdhe_public.len());
        params.extend_from_slice(client_random);
        params.extend_from_slice(server_random);
        params.push(ecdhe_public.len() as u8);
        params.extend_from_slice(ecdhe_public);
        params
    }
}

/// CertificateVerify: client signature over the hello transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateVerify {
    pub signature: Bytes,
}

impl CertificateVerify {
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_vec16(&mut buf, &self.signature)?;
        Ok(buf.freeze())
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        Ok(Self { signature: get_vec16(&mut buf)? })
    }
}

/// Finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub verify_data: [u8; VERIFY_DATA_LEN],
}

impl Finished {
    pub fn serialize(&self) -> Bytes {
        Bytes::copy_from_slice(&self.verify_data)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let verify_data = data
            .try_into()
            .map_err(|_| Error::InvalidPacket(format!("Finished must be {} bytes, got {}", VERIFY_DATA_LEN, data.len())))?;
        Ok(Self { verify_data })
    }
}

fn ensure(buf: &&[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::BufferTooSmall { required: needed, available: buf.remaining() });
    }
    Ok(())
}

fn read_version(buf: &mut &[u8]) -> Result<()> {
    ensure(buf, 2)?;
    let version = buf.get_u16();
    if version != DTLS_VERSION_1_2 {
        return Err(Error::InvalidPacket(format!("Unsupported DTLS version: {:#06x}", version)));
    }
    Ok(())
}

fn read_random(buf: &mut &[u8]) -> Result<[u8; RANDOM_LEN]> {
    ensure(buf, RANDOM_LEN)?;
    let mut random = [0u8; RANDOM_LEN];
    buf.copy_to_slice(&mut random);
    Ok(random)
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_uint(value as u64, 3);
}

fn put_vec8(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    if data.len() > u8::MAX as usize {
        return Err(Error::EncodeError(format!("Vector too long: {} bytes", data.len())));
    }
    buf.put_u8(data.len() as u8);
    buf.put_slice(data);
    Ok(())
}

fn put_vec16(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    if data.len() > u16::MAX as usize {
        return Err(Error::EncodeError(format!("Vector too long: {} bytes", data.len())));
    }
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(())
}

fn put_vec24(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    if data.len() > 0xFF_FFFF {
        return Err(Error::EncodeError(format!("Vector too long: {} bytes", data.len())));
    }
    put_u24(buf, data.len() as u32);
    buf.put_slice(data);
    Ok(())
}

fn take(buf: &mut &[u8], len: usize) -> Result<Bytes> {
    ensure(buf, len)?;
    let data = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(data)
}

fn get_vec8(buf: &mut &[u8]) -> Result<Bytes> {
    ensure(buf, 1)?;
    let len = buf.get_u8() as usize;
    take(buf, len)
}

fn get_vec16(buf: &mut &[u8]) -> Result<Bytes> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    take(buf, len)
}

fn get_vec24(buf: &mut &[u8]) -> Result<Bytes> {
    ensure(buf, 3)?;
    let len = buf.get_uint(3) as usize;
    take(buf, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello() -> ClientHello {
        ClientHello {
            random: [7; RANDOM_LEN],
            ecdhe_public: Bytes::from(vec![4u8; 65]),
            certificate: Bytes::from(vec![0x30; 300]),
            srtp_profiles: vec![0x0001, 0x0007],
        }
    }

    #[test]
    fn test_client_hello_round_trip() {
        let hello = client_hello();
        let body = hello.serialize().unwrap();
        assert_eq!(ClientHello::parse(&body).unwrap(), hello);
    }

    #[test]
    fn test_server_hello_round_trip() {
        let hello = ServerHello {
            random: [9; RANDOM_LEN],
            ecdhe_public: Bytes::from(vec![4u8; 65]),
            certificate: Bytes::from(vec![0x30; 310]),
            srtp_profile: 0x0001,
            signature: Bytes::from(vec![0x30; 71]),
        };
        let body = hello.serialize().unwrap();
        assert_eq!(ServerHello::parse(&body).unwrap(), hello);
        assert!(ServerHello::parse(&body[..body.len() - 1]).is_err());
    }

    #[test]
    fn test_handshake_header() {
        let body = client_hello().serialize().unwrap();
        let message = HandshakeMessage::new(HandshakeType::ClientHello, 3, body.clone());
        let bytes = message.serialize();

        assert_eq!(bytes[0], 1);
        assert_eq!(bytes.len(), HANDSHAKE_HEADER_LEN + body.len());
        assert_eq!(&bytes[4..6], &[0, 3]);
        assert_eq!(HandshakeMessage::parse(&bytes).unwrap(), message);
    }

    #[test]
    fn test_fragmented_message_is_rejected() {
        let mut bytes = HandshakeMessage::new(HandshakeType::Finished, 0, Bytes::from_static(&[0; 12]))
            .serialize()
            .to_vec();
        // fragment offset = 1
        bytes[8] = 1;
        assert!(HandshakeMessage::parse(&bytes).is_err());
    }

    #[test]
    fn test_finished_length() {
        assert!(Finished::parse(&[0; 11]).is_err());
        let finished = Finished::parse(&[5; 12]).unwrap();
        assert_eq!(finished.serialize(), Bytes::from_static(&[5; 12]));
    }
}
