//! STUN message codec (RFC 5389) with the ICE and TURN attributes the agent uses.
//!
//! Messages are built as a list of attributes and encoded in one of three
//! ways: plain, with FINGERPRINT only, or signed with MESSAGE-INTEGRITY
//! followed by FINGERPRINT. Verification works on the raw datagram, since
//! both trailers cover the exact bytes that were received.

use std::net::{IpAddr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::Rng;
use sha1::Sha1;

use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// STUN message header size (20 bytes)
pub const STUN_HEADER_SIZE: usize = 20;

/// STUN magic cookie value (RFC 5389)
pub const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// Value XORed into the CRC-32 of the FINGERPRINT attribute
const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// Size of the MESSAGE-INTEGRITY attribute including its header
const INTEGRITY_ATTR_SIZE: usize = 24;

/// Size of the FINGERPRINT attribute including its header
const FINGERPRINT_ATTR_SIZE: usize = 8;

/// Binding method
pub const METHOD_BINDING: u16 = 0x001;

/// TURN Allocate method (RFC 5766)
pub const METHOD_ALLOCATE: u16 = 0x003;

/// REQUESTED-TRANSPORT value for UDP
pub const TRANSPORT_UDP: u8 = 17;

/// Transaction identifier
pub type TransactionId = [u8; 12];

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl StunClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }

    /// Whether this class answers a request
    pub fn is_response(self) -> bool {
        matches!(self, Self::SuccessResponse | Self::ErrorResponse)
    }
}

/// STUN message type: a class and a 12-bit method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StunMessageType {
    pub class: StunClass,
    pub method: u16,
}

impl StunMessageType {
    pub const BINDING_REQUEST: Self = Self::new(StunClass::Request, METHOD_BINDING);
    pub const BINDING_RESPONSE: Self = Self::new(StunClass::SuccessResponse, METHOD_BINDING);
    pub const BINDING_ERROR_RESPONSE: Self = Self::new(StunClass::ErrorResponse, METHOD_BINDING);
    pub const ALLOCATE_REQUEST: Self = Self::new(StunClass::Request, METHOD_ALLOCATE);

    pub const fn new(class: StunClass, method: u16) -> Self {
        Self { class, method }
    }

    /// Convert to u16 for encoding
    pub fn to_u16(self) -> u16 {
        // Class bits are interleaved with the method bits, RFC 5389 section 6
        let method = self.method & 0x0FFF;
        let class = self.class.bits();
        let m0 = method & 0x000F;
        let m1 = (method & 0x0070) << 1;
        let m2 = (method & 0x0F80) << 2;
        let c0 = (class & 0x01) << 4;
        let c1 = (class & 0x02) << 7;
        m2 | c1 | m1 | c0 | m0
    }

    /// Convert from u16 to message type
    pub fn from_u16(value: u16) -> Self {
        let class = ((value >> 4) & 0x01) | ((value >> 7) & 0x02);
        let method = (value & 0x000F) | ((value >> 1) & 0x0070) | ((value >> 2) & 0x0F80);
        Self {
            class: StunClass::from_bits(class),
            method,
        }
    }
}

/// STUN attribute types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunAttributeType {
    MappedAddress,
    Username,
    MessageIntegrity,
    ErrorCode,
    UnknownAttributes,
    Lifetime,
    XorPeerAddress,
    Realm,
    Nonce,
    XorRelayedAddress,
    RequestedTransport,
    XorMappedAddress,
    Priority,
    UseCandidate,
    Software,
    Fingerprint,
    IceControlled,
    IceControlling,
    Other(u16),
}

impl From<u16> for StunAttributeType {
    fn from(value: u16) -> Self {
        match value {
            0x0001 => Self::MappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x000D => Self::Lifetime,
            0x0012 => Self::XorPeerAddress,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0016 => Self::XorRelayedAddress,
            0x0019 => Self::RequestedTransport,
            0x0020 => Self::XorMappedAddress,
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x8022 => Self::Software,
            0x8028 => Self::Fingerprint,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            _ => Self::Other(value),
        }
    }
}

impl From<StunAttributeType> for u16 {
    fn from(attr_type: StunAttributeType) -> Self {
        match attr_type {
            StunAttributeType::MappedAddress => 0x0001,
            StunAttributeType::Username => 0x0006,
            StunAttributeType::MessageIntegrity => 0x0008,
            StunAttributeType::ErrorCode => 0x0009,
            StunAttributeType::UnknownAttributes => 0x000A,
            StunAttributeType::Lifetime => 0x000D,
            StunAttributeType::XorPeerAddress => 0x0012,
            StunAttributeType::Realm => 0x0014,
            StunAttributeType::Nonce => 0x0015,
            StunAttributeType::XorRelayedAddress => 0x0016,
            StunAttributeType::RequestedTransport => 0x0019,
            StunAttributeType::XorMappedAddress => 0x0020,
            StunAttributeType::Priority => 0x0024,
            StunAttributeType::UseCandidate => 0x0025,
            StunAttributeType::Software => 0x8022,
            StunAttributeType::Fingerprint => 0x8028,
            StunAttributeType::IceControlled => 0x8029,
            StunAttributeType::IceControlling => 0x802A,
            StunAttributeType::Other(value) => value,
        }
    }
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribute {
    /// Attribute type
    pub attr_type: StunAttributeType,
    /// Attribute value
    pub value: Bytes,
}

impl StunAttribute {
    /// Create a new attribute
    pub fn new(attr_type: StunAttributeType, value: Bytes) -> Self {
        Self { attr_type, value }
    }

    /// Create a XOR-MAPPED-ADDRESS attribute
    pub fn xor_mapped_address(addr: SocketAddr, transaction_id: &TransactionId) -> Self {
        Self::new(
            StunAttributeType::XorMappedAddress,
            encode_xor_address(addr, transaction_id),
        )
    }

    /// Create a XOR-RELAYED-ADDRESS attribute
    pub fn xor_relayed_address(addr: SocketAddr, transaction_id: &TransactionId) -> Self {
        Self::new(
            StunAttributeType::XorRelayedAddress,
            encode_xor_address(addr, transaction_id),
        )
    }

    /// Create a USERNAME attribute
    pub fn username(username: &str) -> Self {
        Self::new(StunAttributeType::Username, Bytes::copy_from_slice(username.as_bytes()))
    }

    /// Create a SOFTWARE attribute
    pub fn software(software: &str) -> Self {
        Self::new(StunAttributeType::Software, Bytes::copy_from_slice(software.as_bytes()))
    }

    /// Create a REALM attribute
    pub fn realm(realm: &str) -> Self {
        Self::new(StunAttributeType::Realm, Bytes::copy_from_slice(realm.as_bytes()))
    }

    /// Create a NONCE attribute
    pub fn nonce(nonce: &str) -> Self {
        Self::new(StunAttributeType::Nonce, Bytes::copy_from_slice(nonce.as_bytes()))
    }

    /// Create a PRIORITY attribute
    pub fn priority(priority: u32) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u32(priority);
        Self::new(StunAttributeType::Priority, value.freeze())
    }

    /// Create a LIFETIME attribute (seconds)
    pub fn lifetime(seconds: u32) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u32(seconds);
        Self::new(StunAttributeType::Lifetime, value.freeze())
    }

    /// Create a REQUESTED-TRANSPORT attribute
    pub fn requested_transport(protocol: u8) -> Self {
        let mut value = BytesMut::with_capacity(4);
        value.put_u8(protocol);
        value.put_slice(&[0, 0, 0]);
        Self::new(StunAttributeType::RequestedTransport, value.freeze())
    }

    /// Create a USE-CANDIDATE attribute
    pub fn use_candidate() -> Self {
        Self::new(StunAttributeType::UseCandidate, Bytes::new())
    }

    /// Create an ICE-CONTROLLING attribute
    pub fn ice_controlling(tiebreaker: u64) -> Self {
        let mut value = BytesMut::with_capacity(8);
        value.put_u64(tiebreaker);
        Self::new(StunAttributeType::IceControlling, value.freeze())
    }

    /// Create an ICE-CONTROLLED attribute
    pub fn ice_controlled(tiebreaker: u64) -> Self {
        let mut value = BytesMut::with_capacity(8);
        value.put_u64(tiebreaker);
        Self::new(StunAttributeType::IceControlled, value.freeze())
    }

    /// Create an ERROR-CODE attribute
    pub fn error_code(code: u16, reason: &str) -> Self {
        let mut value = BytesMut::with_capacity(4 + reason.len());
        value.put_u16(0);
        value.put_u8((code / 100) as u8);
        value.put_u8((code % 100) as u8);
        value.put_slice(reason.as_bytes());
        Self::new(StunAttributeType::ErrorCode, value.freeze())
    }

    /// Get socket address from a XOR-MAPPED-ADDRESS or XOR-RELAYED-ADDRESS attribute
    pub fn get_xor_address(&self, transaction_id: &TransactionId) -> Result<SocketAddr> {
        match self.attr_type {
            StunAttributeType::XorMappedAddress
            | StunAttributeType::XorRelayedAddress
            | StunAttributeType::XorPeerAddress => decode_xor_address(&self.value, transaction_id),
            other => Err(Error::StunError(format!("{:?} is not an XOR address attribute", other))),
        }
    }

    fn as_u32(&self) -> Option<u32> {
        (self.value.len() == 4).then(|| BigEndian::read_u32(&self.value))
    }

    fn as_u64(&self) -> Option<u64> {
        (self.value.len() == 8).then(|| BigEndian::read_u64(&self.value))
    }

    fn as_string(&self) -> Option<String> {
        std::str::from_utf8(&self.value).ok().map(str::to_string)
    }
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> Bytes {
    let mut value = BytesMut::with_capacity(20);

    // First byte is reserved and should be 0
    value.put_u8(0);

    match addr.ip() {
        IpAddr::V4(ipv4) => {
            value.put_u8(0x01);
            value.put_u16(addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16);
            value.put_u32(u32::from_be_bytes(ipv4.octets()) ^ STUN_MAGIC_COOKIE);
        }
        IpAddr::V6(ipv6) => {
            value.put_u8(0x02);
            value.put_u16(addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16);
            let mask = xor_mask(transaction_id);
            let octets = ipv6.octets();
            for i in 0..16 {
                value.put_u8(octets[i] ^ mask[i]);
            }
        }
    }

    value.freeze()
}

fn decode_xor_address(value: &[u8], transaction_id: &TransactionId) -> Result<SocketAddr> {
    if value.len() < 8 {
        return Err(Error::StunError("XOR address attribute too short".to_string()));
    }

    let mut buf = value;
    buf.advance(1);
    let family = buf.get_u8();
    let port = buf.get_u16() ^ (STUN_MAGIC_COOKIE >> 16) as u16;

    let ip = match family {
        0x01 => IpAddr::from((buf.get_u32() ^ STUN_MAGIC_COOKIE).to_be_bytes()),
        0x02 => {
            if buf.remaining() < 16 {
                return Err(Error::StunError("XOR IPv6 address truncated".to_string()));
            }
            let mask = xor_mask(transaction_id);
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            for i in 0..16 {
                octets[i] ^= mask[i];
            }
            IpAddr::from(octets)
        }
        _ => return Err(Error::StunError(format!("Unsupported address family: {}", family))),
    };

    Ok(SocketAddr::new(ip, port))
}

/// Magic cookie followed by the transaction id, the IPv6 XOR mask
fn xor_mask(transaction_id: &TransactionId) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(transaction_id);
    mask
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message type
    pub msg_type: StunMessageType,
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// Attributes
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a new STUN message with a random transaction id
    pub fn new(msg_type: StunMessageType) -> Self {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill(&mut transaction_id);

        Self {
            msg_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create a new binding request
    pub fn binding_request() -> Self {
        Self::new(StunMessageType::BINDING_REQUEST)
    }

    /// Create a success response answering `request`
    pub fn success_response(request: &StunMessage) -> Self {
        Self {
            msg_type: StunMessageType::new(StunClass::SuccessResponse, request.msg_type.method),
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create an error response answering `request`
    pub fn error_response(request: &StunMessage, code: u16, reason: &str) -> Self {
        let mut response = Self {
            msg_type: StunMessageType::new(StunClass::ErrorResponse, request.msg_type.method),
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        };
        response.add_attribute(StunAttribute::error_code(code, reason));
        response
    }

    /// Add an attribute
    pub fn add_attribute(&mut self, attr: StunAttribute) -> &mut Self {
        self.attributes.push(attr);
        self
    }

    /// Builder-style variant of [`add_attribute`](Self::add_attribute)
    pub fn with_attribute(mut self, attr: StunAttribute) -> Self {
        self.attributes.push(attr);
        self
    }

    /// Encode message to bytes without integrity or fingerprint
    pub fn encode(&self) -> Bytes {
        self.encode_attributes().freeze()
    }

    /// Encode message followed by a FINGERPRINT attribute
    pub fn encode_with_fingerprint(&self) -> Bytes {
        let mut buf = self.encode_attributes();
        append_fingerprint(&mut buf);
        buf.freeze()
    }

    /// Encode message followed by MESSAGE-INTEGRITY (HMAC-SHA1 with `key`)
    /// and FINGERPRINT
    pub fn encode_signed(&self, key: &[u8]) -> Result<Bytes> {
        let mut buf = self.encode_attributes();
        append_integrity(&mut buf, key)?;
        append_fingerprint(&mut buf);
        Ok(buf.freeze())
    }

    fn encode_attributes(&self) -> BytesMut {
        let attr_size: usize = self
            .attributes
            .iter()
            .map(|attr| 4 + padded_len(attr.value.len()))
            .sum();

        let mut buf = BytesMut::with_capacity(
            STUN_HEADER_SIZE + attr_size + INTEGRITY_ATTR_SIZE + FINGERPRINT_ATTR_SIZE,
        );

        buf.put_u16(self.msg_type.to_u16());
        buf.put_u16(attr_size as u16);
        buf.put_u32(STUN_MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);

        for attr in &self.attributes {
            let attr_type: u16 = attr.attr_type.into();
            buf.put_u16(attr_type);
            buf.put_u16(attr.value.len() as u16);
            buf.put_slice(&attr.value);
            buf.put_bytes(0, padded_len(attr.value.len()) - attr.value.len());
        }

        buf
    }

    /// Decode message from bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STUN_HEADER_SIZE {
            return Err(Error::StunError("Packet too small for STUN header".to_string()));
        }

        // First two bits are always 0
        if (bytes[0] & 0xC0) != 0 {
            return Err(Error::StunError("Invalid STUN message".to_string()));
        }

        let msg_type = StunMessageType::from_u16(BigEndian::read_u16(&bytes[0..2]));
        let msg_length = BigEndian::read_u16(&bytes[2..4]) as usize;

        if BigEndian::read_u32(&bytes[4..8]) != STUN_MAGIC_COOKIE {
            return Err(Error::StunError("Invalid STUN magic cookie".to_string()));
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);

        if bytes.len() < STUN_HEADER_SIZE + msg_length {
            return Err(Error::StunError("Packet too small for STUN attributes".to_string()));
        }

        let mut attributes = Vec::new();
        for (attr_type, offset, length) in AttributeIter::new(&bytes[..STUN_HEADER_SIZE + msg_length]) {
            attributes.push(StunAttribute {
                attr_type: attr_type.into(),
                value: Bytes::copy_from_slice(&bytes[offset + 4..offset + 4 + length]),
            });
        }

        Ok(Self {
            msg_type,
            transaction_id,
            attributes,
        })
    }

    /// Get an attribute by type
    pub fn get_attribute(&self, attr_type: StunAttributeType) -> Option<&StunAttribute> {
        self.attributes.iter().find(|attr| attr.attr_type == attr_type)
    }

    /// Whether the message carries an attribute of this type
    pub fn has_attribute(&self, attr_type: StunAttributeType) -> bool {
        self.get_attribute(attr_type).is_some()
    }

    pub fn username(&self) -> Option<String> {
        self.get_attribute(StunAttributeType::Username)?.as_string()
    }

    pub fn realm(&self) -> Option<String> {
        self.get_attribute(StunAttributeType::Realm)?.as_string()
    }

    pub fn nonce(&self) -> Option<String> {
        self.get_attribute(StunAttributeType::Nonce)?.as_string()
    }

    pub fn priority(&self) -> Option<u32> {
        self.get_attribute(StunAttributeType::Priority)?.as_u32()
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        self.get_attribute(StunAttributeType::IceControlling)?.as_u64()
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        self.get_attribute(StunAttributeType::IceControlled)?.as_u64()
    }

    pub fn use_candidate(&self) -> bool {
        self.has_attribute(StunAttributeType::UseCandidate)
    }

    /// Error code and reason phrase of an error response
    pub fn error_code(&self) -> Option<(u16, String)> {
        let attr = self.get_attribute(StunAttributeType::ErrorCode)?;
        if attr.value.len() < 4 {
            return None;
        }
        let code = (attr.value[2] & 0x07) as u16 * 100 + attr.value[3] as u16;
        let reason = String::from_utf8_lossy(&attr.value[4..]).into_owned();
        Some((code, reason))
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.get_attribute(StunAttributeType::XorMappedAddress)?
            .get_xor_address(&self.transaction_id)
            .ok()
    }

    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.get_attribute(StunAttributeType::XorRelayedAddress)?
            .get_xor_address(&self.transaction_id)
            .ok()
    }
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Walks the attributes of a raw message, yielding (type, offset, value length)
struct AttributeIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> AttributeIter<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: STUN_HEADER_SIZE,
        }
    }
}

impl Iterator for AttributeIter<'_> {
    type Item = (u16, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + 4 > self.bytes.len() {
            return None;
        }
        let offset = self.offset;
        let attr_type = BigEndian::read_u16(&self.bytes[offset..offset + 2]);
        let length = BigEndian::read_u16(&self.bytes[offset + 2..offset + 4]) as usize;
        if offset + 4 + length > self.bytes.len() {
            return None;
        }
        self.offset = offset + 4 + padded_len(length);
        Some((attr_type, offset, length))
    }
}

fn set_length(buf: &mut [u8], length: usize) {
    BigEndian::write_u16(&mut buf[2..4], length as u16);
}

fn append_integrity(buf: &mut BytesMut, key: &[u8]) -> Result<()> {
    let length = buf.len() - STUN_HEADER_SIZE + INTEGRITY_ATTR_SIZE;
    set_length(buf, length);

    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|e| Error::StunError(format!("Invalid integrity key: {}", e)))?;
    mac.update(buf);
    let digest = mac.finalize().into_bytes();

    buf.put_u16(StunAttributeType::MessageIntegrity.into());
    buf.put_u16(20);
    buf.put_slice(&digest);
    Ok(())
}

fn append_fingerprint(buf: &mut BytesMut) {
    let length = buf.len() - STUN_HEADER_SIZE + FINGERPRINT_ATTR_SIZE;
    set_length(buf, length);

    let crc = crc32fast::hash(buf) ^ FINGERPRINT_XOR;
    buf.put_u16(StunAttributeType::Fingerprint.into());
    buf.put_u16(4);
    buf.put_u32(crc);
}

fn find_attribute(raw: &[u8], attr_type: StunAttributeType) -> Option<(usize, usize)> {
    let wanted: u16 = attr_type.into();
    AttributeIter::new(raw)
        .find(|(t, _, _)| *t == wanted)
        .map(|(_, offset, length)| (offset, length))
}

/// Verify the FINGERPRINT attribute of a raw message, if it has one
pub fn check_fingerprint(raw: &[u8]) -> Result<()> {
    let Some((offset, length)) = find_attribute(raw, StunAttributeType::Fingerprint) else {
        return Ok(());
    };
    if length != 4 {
        return Err(Error::FingerprintMismatch);
    }
    let expected = crc32fast::hash(&raw[..offset]) ^ FINGERPRINT_XOR;
    if BigEndian::read_u32(&raw[offset + 4..offset + 8]) == expected {
        Ok(())
    } else {
        Err(Error::FingerprintMismatch)
    }
}

/// Verify the MESSAGE-INTEGRITY attribute of a raw message with `key`.
///
/// A message without MESSAGE-INTEGRITY fails the check.
pub fn check_integrity(raw: &[u8], key: &[u8]) -> Result<()> {
    let (offset, length) = find_attribute(raw, StunAttributeType::MessageIntegrity)
        .ok_or(Error::IntegrityCheckFailed)?;
    if length != 20 {
        return Err(Error::IntegrityCheckFailed);
    }

    // The HMAC covers everything before the attribute, with the header length
    // pointing just past MESSAGE-INTEGRITY
    let mut covered = raw[..offset].to_vec();
    set_length(&mut covered, offset - STUN_HEADER_SIZE + INTEGRITY_ATTR_SIZE);

    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| Error::IntegrityCheckFailed)?;
    mac.update(&covered);
    mac.verify_slice(&raw[offset + 4..offset + 24])
        .map_err(|_| Error::IntegrityCheckFailed)
}

/// TURN long-term credential key: MD5(username ":" realm ":" password)
pub fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let mut hasher = Md5::new();
    hasher.update(format!("{}:{}:{}", username, realm, password).as_bytes());
    hasher.finalize().to_vec()
}

/// Whether a datagram looks like a STUN message (RFC 7983 demultiplexing)
pub fn is_stun_message(bytes: &[u8]) -> bool {
    bytes.len() >= STUN_HEADER_SIZE
        && bytes[0] <= 3
        && BigEndian::read_u32(&bytes[4..8]) == STUN_MAGIC_COOKIE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn signed_request(key: &[u8]) -> (StunMessage, Bytes) {
        let msg = StunMessage::binding_request()
            .with_attribute(StunAttribute::username("remote:local"))
            .with_attribute(StunAttribute::priority(1_862_270_975))
            .with_attribute(StunAttribute::ice_controlling(42))
            .with_attribute(StunAttribute::use_candidate());
        let raw = msg.encode_signed(key).unwrap();
        (msg, raw)
    }

    #[test]
    fn message_type_encoding() {
        assert_eq!(StunMessageType::BINDING_REQUEST.to_u16(), 0x0001);
        assert_eq!(StunMessageType::BINDING_RESPONSE.to_u16(), 0x0101);
        assert_eq!(StunMessageType::BINDING_ERROR_RESPONSE.to_u16(), 0x0111);
        assert_eq!(StunMessageType::ALLOCATE_REQUEST.to_u16(), 0x0003);
        assert_eq!(
            StunMessageType::from_u16(0x0113),
            StunMessageType::new(StunClass::ErrorResponse, METHOD_ALLOCATE)
        );
        assert_eq!(
            StunMessageType::from_u16(0x0103),
            StunMessageType::new(StunClass::SuccessResponse, METHOD_ALLOCATE)
        );
    }

    #[test]
    fn signed_message_verifies_and_decodes() {
        let (msg, raw) = signed_request(b"password");

        assert!(check_fingerprint(&raw).is_ok());
        assert!(check_integrity(&raw, b"password").is_ok());

        let decoded = StunMessage::decode(&raw).unwrap();
        assert_eq!(decoded.transaction_id, msg.transaction_id);
        assert_eq!(decoded.username().as_deref(), Some("remote:local"));
        assert_eq!(decoded.priority(), Some(1_862_270_975));
        assert_eq!(decoded.ice_controlling(), Some(42));
        assert!(decoded.use_candidate());
        assert!(decoded.has_attribute(StunAttributeType::MessageIntegrity));
        assert!(decoded.has_attribute(StunAttributeType::Fingerprint));
    }

    #[test]
    fn wrong_key_fails_integrity() {
        let (_, raw) = signed_request(b"password");
        assert!(matches!(
            check_integrity(&raw, b"other"),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn tampered_message_is_rejected() {
        let (_, raw) = signed_request(b"password");
        let mut tampered = raw.to_vec();
        // flip a bit inside the PRIORITY value
        let priority_offset = STUN_HEADER_SIZE + 4 + padded_len("remote:local".len()) + 4;
        tampered[priority_offset] ^= 0x01;

        assert!(matches!(check_fingerprint(&tampered), Err(Error::FingerprintMismatch)));
        assert!(matches!(
            check_integrity(&tampered, b"password"),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn unsigned_message_fails_integrity_but_passes_fingerprint() {
        let raw = StunMessage::binding_request().encode();
        assert!(check_fingerprint(&raw).is_ok());
        assert!(check_integrity(&raw, b"password").is_err());

        let raw = StunMessage::binding_request().encode_with_fingerprint();
        assert!(check_fingerprint(&raw).is_ok());
    }

    #[test]
    fn xor_addresses() {
        let request = StunMessage::binding_request();
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 32853);
        let v6 = SocketAddr::new(
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0x1234, 0x5678, 0x11, 0x2233, 0x4455, 0x6677)),
            32853,
        );

        let mut response = StunMessage::success_response(&request);
        response.add_attribute(StunAttribute::xor_mapped_address(v4, &request.transaction_id));
        response.add_attribute(StunAttribute::xor_relayed_address(v6, &request.transaction_id));

        let decoded = StunMessage::decode(&response.encode()).unwrap();
        assert_eq!(decoded.msg_type, StunMessageType::BINDING_RESPONSE);
        assert_eq!(decoded.xor_mapped_address(), Some(v4));
        assert_eq!(decoded.xor_relayed_address(), Some(v6));
    }

    #[test]
    fn error_response_carries_code() {
        let request = StunMessage::new(StunMessageType::ALLOCATE_REQUEST);
        let mut response = StunMessage::error_response(&request, 401, "Unauthorized");
        response.add_attribute(StunAttribute::realm("example.org"));
        response.add_attribute(StunAttribute::nonce("abc"));

        let decoded = StunMessage::decode(&response.encode_with_fingerprint()).unwrap();
        assert_eq!(decoded.msg_type.class, StunClass::ErrorResponse);
        assert_eq!(decoded.msg_type.method, METHOD_ALLOCATE);
        assert_eq!(decoded.error_code(), Some((401, "Unauthorized".to_string())));
        assert_eq!(decoded.realm().as_deref(), Some("example.org"));
        assert_eq!(decoded.nonce().as_deref(), Some("abc"));
    }

    #[test]
    fn demultiplexing_recognises_stun() {
        let raw = StunMessage::binding_request().encode();
        assert!(is_stun_message(&raw));
        assert!(!is_stun_message(&[22, 254, 253, 0, 0]));
        assert!(!is_stun_message(&[0x80; 40]));
    }

    #[test]
    fn truncated_packets_are_errors() {
        assert!(StunMessage::decode(&[0u8; 10]).is_err());
        let raw = StunMessage::binding_request()
            .with_attribute(StunAttribute::username("abc"))
            .encode();
        assert!(StunMessage::decode(&raw[..raw.len() - 2]).is_err());
    }

    #[test]
    fn long_term_key_is_md5_of_credentials() {
        let key = long_term_key("user", "realm", "pass");
        assert_eq!(key.len(), 16);
        assert_ne!(key, long_term_key("user", "realm", "other"));
    }
}
