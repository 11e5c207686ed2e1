use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

/// AES-128 in counter mode with a big-endian 128-bit counter (RFC 3711 4.1.1)
pub(crate) type Aes128Cm = Ctr128BE<Aes128>;

/// Master key length for AES-128
pub const SRTP_MASTER_KEY_LEN: usize = 16;

/// Master salt length
pub const SRTP_MASTER_SALT_LEN: usize = 14;

/// Session authentication key length for HMAC-SHA1
pub const SRTP_AUTH_KEY_LEN: usize = 20;

/// Label values for SRTP key derivation (RFC 3711 section 4.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivationLabel {
    /// RTP encryption key
    RtpEncryption = 0,

    /// RTP authentication key
    RtpAuthentication = 1,

    /// RTP salt (for IV creation)
    RtpSalt = 2,

    /// RTCP encryption key
    RtcpEncryption = 3,

    /// RTCP authentication key
    RtcpAuthentication = 4,

    /// RTCP salt (for IV creation)
    RtcpSalt = 5,
}

/// Derive a session key with the AES-CM PRF, key derivation rate 0.
pub fn srtp_kdf(
    master_key: &[u8; SRTP_MASTER_KEY_LEN],
    master_salt: &[u8; SRTP_MASTER_SALT_LEN],
    label: KeyDerivationLabel,
    output_len: usize,
) -> Vec<u8> {
    // x = (label || r) XOR master_salt, with r = 0 and the label at byte 7
    let mut iv = [0u8; 16];
    iv[..SRTP_MASTER_SALT_LEN].copy_from_slice(master_salt);
    iv[7] ^= label as u8;

    let mut output = vec![0u8; output_len];
    let mut cipher = Aes128Cm::new(master_key.into(), &iv.into());
    cipher.apply_keystream(&mut output);
    output
}

/// Counter-mode IV for one packet:
/// `(salt << 16) XOR (ssrc << 64) XOR (index << 16)`
pub fn create_srtp_iv(salt: &[u8; SRTP_MASTER_SALT_LEN], ssrc: u32, index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..SRTP_MASTER_SALT_LEN].copy_from_slice(salt);

    for (i, byte) in ssrc.to_be_bytes().iter().enumerate() {
        iv[4 + i] ^= byte;
    }
    // 48-bit packet index occupies bytes 8..14
    let index_bytes = index.to_be_bytes();
    for i in 0..6 {
        iv[8 + i] ^= index_bytes[2 + i];
    }
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    // Appendix B.3 of RFC 3711
    #[test]
    fn test_rfc3711_key_derivation_vectors() {
        let master_key: [u8; 16] = hex("E1F97A0D3E018BE0D64FA32C06DE4139").try_into().unwrap();
        let master_salt: [u8; 14] = hex("0EC675AD498AFEEBB6960B3AABE6").try_into().unwrap();

        assert_eq!(
            srtp_kdf(&master_key, &master_salt, KeyDerivationLabel::RtpEncryption, 16),
            hex("C61E7A93744F39EE10734AFE3FF7A087")
        );
        assert_eq!(
            srtp_kdf(&master_key, &master_salt, KeyDerivationLabel::RtpSalt, 14),
            hex("30CBBC08863D8C85D49DB34A9AE1")
        );
        assert_eq!(
            srtp_kdf(&master_key, &master_salt, KeyDerivationLabel::RtpAuthentication, 20),
            hex("CEBE321F6FF7716B6FD4AB49AF256A156D38BAA4")
        );
    }

    #[test]
    fn test_labels_give_distinct_keys() {
        let key = [7u8; 16];
        let salt = [9u8; 14];
        let rtp = srtp_kdf(&key, &salt, KeyDerivationLabel::RtpEncryption, 16);
        let rtcp = srtp_kdf(&key, &salt, KeyDerivationLabel::RtcpEncryption, 16);
        assert_ne!(rtp, rtcp);
    }

    #[test]
    fn test_create_srtp_iv() {
        let salt = [0u8; 14];
        let iv = create_srtp_iv(&salt, 0x1234_5678, 0x0000_0001_0002);
        assert_eq!(&iv[4..8], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&iv[8..14], &[0, 0, 0, 1, 0, 2]);
        assert_eq!(&iv[14..], &[0, 0]);
    }
}
