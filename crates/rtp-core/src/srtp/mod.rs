//! Secure RTP (SRTP) implementation
//!
//! This module provides encryption and authentication for RTP/RTCP packets
//! with AES-128 counter mode and HMAC-SHA1-80 (RFC 3711). Keys come from the
//! DTLS-SRTP exporter; see [`crate::dtls::DtlsSession::srtp_session`].

mod context;
pub mod key_derivation;
pub mod replay;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use context::{SrtpContext, SRTP_AUTH_TAG_LEN};
pub use key_derivation::{
    create_srtp_iv, srtp_kdf, KeyDerivationLabel, SRTP_MASTER_KEY_LEN, SRTP_MASTER_SALT_LEN,
};
pub use replay::{ReplayWindow, REPLAY_WINDOW_SIZE};

use crate::Result;

/// SRTP protection profiles (RFC 5764 section 4.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SrtpProfile {
    /// SRTP_AES128_CM_HMAC_SHA1_80
    #[serde(rename = "SRTP_AES128_CM_HMAC_SHA1_80")]
    Aes128CmHmacSha1_80,
}

impl SrtpProfile {
    /// Profile identifier carried in the use_srtp extension
    pub fn id(&self) -> u16 {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 => 0x0001,
        }
    }

    /// Look up a profile by its wire identifier
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x0001 => Some(SrtpProfile::Aes128CmHmacSha1_80),
            _ => None,
        }
    }

    /// Master key length in bytes
    pub fn key_len(&self) -> usize {
        SRTP_MASTER_KEY_LEN
    }

    /// Master salt length in bytes
    pub fn salt_len(&self) -> usize {
        SRTP_MASTER_SALT_LEN
    }

    /// Authentication tag length in bytes
    pub fn tag_len(&self) -> usize {
        SRTP_AUTH_TAG_LEN
    }

    /// Bytes of exported keying material needed for both directions
    pub fn keying_material_len(&self) -> usize {
        2 * (self.key_len() + self.salt_len())
    }
}

impl fmt::Display for SrtpProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 => write!(f, "SRTP_AES128_CM_HMAC_SHA1_80"),
        }
    }
}

/// Master keys and salts for both directions of a session
#[derive(Clone, PartialEq, Eq)]
pub struct SrtpKeyingMaterial {
    /// Key used to protect what we send
    pub local_key: [u8; SRTP_MASTER_KEY_LEN],
    pub local_salt: [u8; SRTP_MASTER_SALT_LEN],

    /// Key used to unprotect what we receive
    pub remote_key: [u8; SRTP_MASTER_KEY_LEN],
    pub remote_salt: [u8; SRTP_MASTER_SALT_LEN],
}

impl SrtpKeyingMaterial {
    /// Split exported keying material (client key, server key, client salt,
    /// server salt) into local and remote halves.
    pub fn from_exported(material: &[u8], is_client: bool) -> Result<Self> {
        let expected = SrtpProfile::Aes128CmHmacSha1_80.keying_material_len();
        if material.len() != expected {
            return Err(crate::Error::SrtpError(format!(
                "Expected {} bytes of keying material, got {}",
                expected,
                material.len()
            )));
        }

        let (client_key, rest) = material.split_at(SRTP_MASTER_KEY_LEN);
        let (server_key, rest) = rest.split_at(SRTP_MASTER_KEY_LEN);
        let (client_salt, server_salt) = rest.split_at(SRTP_MASTER_SALT_LEN);

        let mut ck = [0u8; SRTP_MASTER_KEY_LEN];
        let mut sk = [0u8; SRTP_MASTER_KEY_LEN];
        let mut cs = [0u8; SRTP_MASTER_SALT_LEN];
        let mut ss = [0u8; SRTP_MASTER_SALT_LEN];
        ck.copy_from_slice(client_key);
        sk.copy_from_slice(server_key);
        cs.copy_from_slice(client_salt);
        ss.copy_from_slice(server_salt);

        Ok(if is_client {
            Self { local_key: ck, local_salt: cs, remote_key: sk, remote_salt: ss }
        } else {
            Self { local_key: sk, local_salt: ss, remote_key: ck, remote_salt: cs }
        })
    }

    /// The same material seen from the other end
    pub fn reversed(&self) -> Self {
        Self {
            local_key: self.remote_key,
            local_salt: self.remote_salt,
            remote_key: self.local_key,
            remote_salt: self.local_salt,
        }
    }
}

// Keys never go to logs
impl fmt::Debug for SrtpKeyingMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpKeyingMaterial").finish_non_exhaustive()
    }
}

/// Bidirectional SRTP session: an outbound context for what we send and an
/// inbound context for what we receive.
pub struct SrtpSession {
    profile: SrtpProfile,
    outbound: SrtpContext,
    inbound: SrtpContext,
}

impl SrtpSession {
    /// Create a session from negotiated keying material
    pub fn new(profile: SrtpProfile, material: &SrtpKeyingMaterial) -> Self {
        Self {
            profile,
            outbound: SrtpContext::new(&material.local_key, &material.local_salt),
            inbound: SrtpContext::new(&material.remote_key, &material.remote_salt),
        }
    }

    /// The negotiated protection profile
    pub fn profile(&self) -> SrtpProfile {
        self.profile
    }

    /// Protect an outgoing RTP packet
    pub fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.outbound.protect_rtp(packet)
    }

    /// Verify and decrypt an incoming SRTP packet
    pub fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.inbound.unprotect_rtp(packet)
    }

    /// Protect an outgoing RTCP packet
    pub fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.outbound.protect_rtcp(packet)
    }

    /// Verify and decrypt an incoming SRTCP packet
    pub fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.inbound.unprotect_rtcp(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::rtcp::{RtcpPacket, RtcpReceiverReport};
    use crate::packet::{RtpHeader, RtpPacket};
    use crate::Error;

    fn material() -> SrtpKeyingMaterial {
        SrtpKeyingMaterial {
            local_key: [0x11; 16],
            local_salt: [0x22; 14],
            remote_key: [0x33; 16],
            remote_salt: [0x44; 14],
        }
    }

    fn pair() -> (SrtpSession, SrtpSession) {
        let m = material();
        (
            SrtpSession::new(SrtpProfile::Aes128CmHmacSha1_80, &m),
            SrtpSession::new(SrtpProfile::Aes128CmHmacSha1_80, &m.reversed()),
        )
    }

    fn rtp(seq: u16, payload: &[u8]) -> Bytes {
        let header = RtpHeader::new(96, seq, 3000, 0xCAFE_BABE);
        RtpPacket::new(header, Bytes::copy_from_slice(payload))
            .serialize()
            .unwrap()
    }

    #[test]
    fn test_rtp_round_trip() {
        let (mut alice, mut bob) = pair();
        let plain = rtp(1, b"hello media");

        let protected = alice.protect_rtp(&plain).unwrap();
        assert_eq!(protected.len(), plain.len() + SRTP_AUTH_TAG_LEN);
        // Header in the clear, payload not
        assert_eq!(&protected[..12], &plain[..12]);
        assert_ne!(&protected[12..plain.len()], &plain[12..]);

        let recovered = bob.unprotect_rtp(&protected).unwrap();
        assert_eq!(recovered, plain);
    }

    #[test]
    fn test_tampered_packet_fails_authentication() {
        let (mut alice, mut bob) = pair();
        let mut protected = alice.protect_rtp(&rtp(5, b"payload")).unwrap().to_vec();
        protected[14] ^= 0x01;

        assert_eq!(
            bob.unprotect_rtp(&protected),
            Err(Error::AuthenticationFailed(0xCAFE_BABE))
        );
    }

    #[test]
    fn test_replayed_packet_is_rejected() {
        let (mut alice, mut bob) = pair();
        let protected = alice.protect_rtp(&rtp(7, b"once")).unwrap();

        bob.unprotect_rtp(&protected).unwrap();
        assert_eq!(
            bob.unprotect_rtp(&protected),
            Err(Error::ReplayedPacket { ssrc: 0xCAFE_BABE, index: 7 })
        );
    }

    #[test]
    fn test_out_of_order_within_window() {
        let (mut alice, mut bob) = pair();
        let first = alice.protect_rtp(&rtp(10, b"a")).unwrap();
        let second = alice.protect_rtp(&rtp(11, b"b")).unwrap();

        bob.unprotect_rtp(&second).unwrap();
        assert_eq!(bob.unprotect_rtp(&first).unwrap(), rtp(10, b"a"));
    }

    #[test]
    fn test_rollover_counter_advances_on_wrap() {
        let (mut alice, mut bob) = pair();
        for seq in [65534u16, 65535, 0, 1] {
            let protected = alice.protect_rtp(&rtp(seq, b"wrap")).unwrap();
            assert_eq!(bob.unprotect_rtp(&protected).unwrap(), rtp(seq, b"wrap"));
        }
        assert_eq!(alice.outbound.rollover_counter(0xCAFE_BABE), Some(1));
        assert_eq!(bob.inbound.rollover_counter(0xCAFE_BABE), Some(1));
    }

    #[test]
    fn test_wrong_keys_fail() {
        let (mut alice, _) = pair();
        // Same keys in both directions is not what alice used
        let mut eve = SrtpSession::new(SrtpProfile::Aes128CmHmacSha1_80, &material());
        let protected = alice.protect_rtp(&rtp(1, b"secret")).unwrap();
        assert!(matches!(eve.unprotect_rtp(&protected), Err(Error::AuthenticationFailed(_))));
    }

    #[test]
    fn test_rtcp_round_trip_and_replay() {
        let (mut alice, mut bob) = pair();
        let rr = RtcpPacket::ReceiverReport(RtcpReceiverReport::new(0x0102_0304));
        let plain = rr.serialize().unwrap();

        let protected = alice.protect_rtcp(&plain).unwrap();
        assert_eq!(protected.len(), plain.len() + 4 + SRTP_AUTH_TAG_LEN);
        // E flag set, index 0
        assert_eq!(&protected[plain.len()..plain.len() + 4], &[0x80, 0, 0, 0]);

        assert_eq!(bob.unprotect_rtcp(&protected).unwrap(), plain);
        assert!(matches!(bob.unprotect_rtcp(&protected), Err(Error::ReplayedPacket { .. })));

        let next = alice.protect_rtcp(&plain).unwrap();
        assert_eq!(bob.unprotect_rtcp(&next).unwrap(), plain);
    }

    #[test]
    fn test_keying_material_split() {
        let exported: Vec<u8> = (0..60).collect();
        let client = SrtpKeyingMaterial::from_exported(&exported, true).unwrap();
        let server = SrtpKeyingMaterial::from_exported(&exported, false).unwrap();

        assert_eq!(client.local_key[0], 0);
        assert_eq!(client.remote_key[0], 16);
        assert_eq!(client.local_salt[0], 32);
        assert_eq!(client.remote_salt[0], 46);
        assert_eq!(server, client.reversed());

        assert!(SrtpKeyingMaterial::from_exported(&exported[..59], true).is_err());
    }

    #[test]
    fn test_profile_ids() {
        assert_eq!(SrtpProfile::from_id(0x0001), Some(SrtpProfile::Aes128CmHmacSha1_80));
        assert_eq!(SrtpProfile::from_id(0x0002), None);
        assert_eq!(SrtpProfile::Aes128CmHmacSha1_80.keying_material_len(), 60);
    }
}
