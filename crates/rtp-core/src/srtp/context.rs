use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::trace;

use super::key_derivation::{
    create_srtp_iv, srtp_kdf, Aes128Cm, KeyDerivationLabel, SRTP_AUTH_KEY_LEN, SRTP_MASTER_KEY_LEN,
    SRTP_MASTER_SALT_LEN,
};
use super::replay::ReplayWindow;
use crate::error::Error;
use crate::packet::RtpHeader;
use crate::{Result, RtpSsrc};

type HmacSha1 = Hmac<Sha1>;

/// HMAC-SHA1-80 tag length
pub const SRTP_AUTH_TAG_LEN: usize = 10;

/// Length of the E flag plus SRTCP index trailer
const SRTCP_INDEX_LEN: usize = 4;

/// Fixed part of an RTCP header that stays in the clear
const RTCP_CLEAR_HEADER_LEN: usize = 8;

const SRTCP_E_FLAG: u32 = 0x8000_0000;
const SRTCP_INDEX_MASK: u32 = 0x7FFF_FFFF;

/// Session keys for one of RTP or RTCP
struct SessionKeys {
    cipher_key: [u8; SRTP_MASTER_KEY_LEN],
    salt: [u8; SRTP_MASTER_SALT_LEN],
    auth_key: [u8; SRTP_AUTH_KEY_LEN],
}

impl SessionKeys {
    fn derive(
        master_key: &[u8; SRTP_MASTER_KEY_LEN],
        master_salt: &[u8; SRTP_MASTER_SALT_LEN],
        labels: [KeyDerivationLabel; 3],
    ) -> Self {
        let mut keys = Self {
            cipher_key: [0; SRTP_MASTER_KEY_LEN],
            salt: [0; SRTP_MASTER_SALT_LEN],
            auth_key: [0; SRTP_AUTH_KEY_LEN],
        };
        keys.cipher_key
            .copy_from_slice(&srtp_kdf(master_key, master_salt, labels[0], SRTP_MASTER_KEY_LEN));
        keys.auth_key
            .copy_from_slice(&srtp_kdf(master_key, master_salt, labels[1], SRTP_AUTH_KEY_LEN));
        keys.salt
            .copy_from_slice(&srtp_kdf(master_key, master_salt, labels[2], SRTP_MASTER_SALT_LEN));
        keys
    }

    fn apply_keystream(&self, ssrc: RtpSsrc, index: u64, data: &mut [u8]) {
        if data.is_empty() {
            return;
        }
        let iv = create_srtp_iv(&self.salt, ssrc, index);
        let mut cipher = Aes128Cm::new((&self.cipher_key).into(), &iv.into());
        cipher.apply_keystream(data);
    }

    fn mac(&self, parts: &[&[u8]]) -> Result<HmacSha1> {
        let mut mac = HmacSha1::new_from_slice(&self.auth_key)
            .map_err(|e| Error::SrtpError(format!("Failed to create HMAC: {}", e)))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac)
    }

    fn tag(&self, parts: &[&[u8]]) -> Result<[u8; SRTP_AUTH_TAG_LEN]> {
        let full = self.mac(parts)?.finalize().into_bytes();
        let mut tag = [0u8; SRTP_AUTH_TAG_LEN];
        tag.copy_from_slice(&full[..SRTP_AUTH_TAG_LEN]);
        Ok(tag)
    }

    fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> bool {
        self.mac(parts)
            .map(|mac| mac.verify_truncated_left(tag).is_ok())
            .unwrap_or(false)
    }
}

/// Rollover tracking and replay state for one SSRC (RFC 3711 section 3.3.1)
#[derive(Default)]
struct StreamState {
    initialized: bool,
    roc: u32,
    highest_seq: u16,
    replay: ReplayWindow,
}

impl StreamState {
    /// Guess the rollover counter of `seq` relative to the highest sequence seen
    fn estimate_roc(&self, seq: u16) -> u32 {
        if !self.initialized {
            return self.roc;
        }
        let s_l = self.highest_seq as i32;
        let seq = seq as i32;
        if s_l < 32768 {
            if seq - s_l > 32768 {
                self.roc.saturating_sub(1)
            } else {
                self.roc
            }
        } else if s_l - 32768 > seq {
            self.roc.wrapping_add(1)
        } else {
            self.roc
        }
    }

    fn update(&mut self, roc: u32, seq: u16) {
        if !self.initialized {
            self.initialized = true;
            self.roc = roc;
            self.highest_seq = seq;
        } else if roc == self.roc.wrapping_add(1) {
            self.roc = roc;
            self.highest_seq = seq;
        } else if roc == self.roc && seq > self.highest_seq {
            self.highest_seq = seq;
        }
    }
}

fn packet_index(roc: u32, seq: u16) -> u64 {
    ((roc as u64) << 16) | seq as u64
}

/// SRTP/SRTCP cryptographic context for one direction of a session
pub struct SrtpContext {
    rtp: SessionKeys,
    rtcp: SessionKeys,
    streams: HashMap<RtpSsrc, StreamState>,
    rtcp_replay: HashMap<RtpSsrc, ReplayWindow>,
    srtcp_index: HashMap<RtpSsrc, u32>,
}

impl SrtpContext {
    /// Derive the session keys from a master key and salt
    pub fn new(master_key: &[u8; SRTP_MASTER_KEY_LEN], master_salt: &[u8; SRTP_MASTER_SALT_LEN]) -> Self {
        Self {
            rtp: SessionKeys::derive(
                master_key,
                master_salt,
                [
                    KeyDerivationLabel::RtpEncryption,
                    KeyDerivationLabel::RtpAuthentication,
                    KeyDerivationLabel::RtpSalt,
                ],
            ),
            rtcp: SessionKeys::derive(
                master_key,
                master_salt,
                [
                    KeyDerivationLabel::RtcpEncryption,
                    KeyDerivationLabel::RtcpAuthentication,
                    KeyDerivationLabel::RtcpSalt,
                ],
            ),
            streams: HashMap::new(),
            rtcp_replay: HashMap::new(),
            srtcp_index: HashMap::new(),
        }
    }

    /// Encrypt and authenticate an RTP packet
    pub fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        let header = RtpHeader::parse(&mut &packet[..])?;
        let header_len = header.size();
        let ssrc = header.ssrc;
        let seq = header.sequence_number;

        let state = self.streams.entry(ssrc).or_default();
        let roc = state.estimate_roc(seq);
        state.update(roc, seq);
        let index = packet_index(roc, seq);

        let mut out = BytesMut::with_capacity(packet.len() + SRTP_AUTH_TAG_LEN);
        out.put_slice(packet);
        self.rtp.apply_keystream(ssrc, index, &mut out[header_len..]);

        let tag = self.rtp.tag(&[&out[..], &roc.to_be_bytes()[..]])?;
        out.put_slice(&tag);
        trace!("Protected RTP ssrc={:#010x} index={}", ssrc, index);
        Ok(out.freeze())
    }

    /// Verify, replay-check and decrypt an SRTP packet
    pub fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < crate::packet::RTP_MIN_HEADER_SIZE + SRTP_AUTH_TAG_LEN {
            return Err(Error::InvalidPacket(format!("SRTP packet too short: {} bytes", packet.len())));
        }
        let (body, tag) = packet.split_at(packet.len() - SRTP_AUTH_TAG_LEN);
        let header = RtpHeader::parse(&mut &body[..])?;
        let header_len = header.size();
        let ssrc = header.ssrc;
        let seq = header.sequence_number;

        let state = self.streams.entry(ssrc).or_default();
        let roc = state.estimate_roc(seq);
        let index = packet_index(roc, seq);
        if !state.replay.check(index) {
            return Err(Error::ReplayedPacket { ssrc, index });
        }
        if !self.rtp.verify(&[body, &roc.to_be_bytes()[..]], tag) {
            return Err(Error::AuthenticationFailed(ssrc));
        }
        state.replay.accept(index);
        state.update(roc, seq);

        let mut out = BytesMut::from(body);
        self.rtp.apply_keystream(ssrc, index, &mut out[header_len..]);
        Ok(out.freeze())
    }

    /// Encrypt and authenticate an RTCP packet
    pub fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < RTCP_CLEAR_HEADER_LEN {
            return Err(Error::InvalidPacket(format!("RTCP packet too short: {} bytes", packet.len())));
        }
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);

        let counter = self.srtcp_index.entry(ssrc).or_insert(0);
        let index = *counter;
        *counter = (*counter + 1) & SRTCP_INDEX_MASK;

        let mut out = BytesMut::with_capacity(packet.len() + SRTCP_INDEX_LEN + SRTP_AUTH_TAG_LEN);
        out.put_slice(packet);
        self.rtcp
            .apply_keystream(ssrc, index as u64, &mut out[RTCP_CLEAR_HEADER_LEN..]);
        out.put_u32(SRTCP_E_FLAG | index);

        let tag = self.rtcp.tag(&[&out[..]])?;
        out.put_slice(&tag);
        Ok(out.freeze())
    }

    /// Verify, replay-check and decrypt an SRTCP packet
    pub fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < RTCP_CLEAR_HEADER_LEN + SRTCP_INDEX_LEN + SRTP_AUTH_TAG_LEN {
            return Err(Error::InvalidPacket(format!("SRTCP packet too short: {} bytes", packet.len())));
        }
        let (authenticated, tag) = packet.split_at(packet.len() - SRTP_AUTH_TAG_LEN);
        let (body, trailer) = authenticated.split_at(authenticated.len() - SRTCP_INDEX_LEN);
        let ssrc = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        let e_index = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let index = (e_index & SRTCP_INDEX_MASK) as u64;

        let window = self.rtcp_replay.entry(ssrc).or_default();
        if !window.check(index) {
            return Err(Error::ReplayedPacket { ssrc, index });
        }
        if !self.rtcp.verify(&[authenticated], tag) {
            return Err(Error::AuthenticationFailed(ssrc));
        }
        window.accept(index);

        let mut out = BytesMut::from(body);
        if e_index & SRTCP_E_FLAG != 0 {
            self.rtcp.apply_keystream(ssrc, index, &mut out[RTCP_CLEAR_HEADER_LEN..]);
        }
        Ok(out.freeze())
    }

    /// Current rollover counter for an SSRC, if it has been seen
    pub fn rollover_counter(&self, ssrc: RtpSsrc) -> Option<u32> {
        self.streams.get(&ssrc).map(|s| s.roc)
    }
}
