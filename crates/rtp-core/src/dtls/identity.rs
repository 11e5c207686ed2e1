//! Certificate identity and fingerprints

use std::fmt;
use std::str::FromStr;

use p256::ecdsa::SigningKey;
use p256::pkcs8::DecodePrivateKey;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::Result;

/// Hash function name used in `a=fingerprint` lines
pub const FINGERPRINT_ALGORITHM: &str = "sha-256";

const FINGERPRINT_LEN: usize = 32;

/// SHA-256 certificate fingerprint (RFC 8122)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Fingerprint of a DER encoded certificate
    pub fn of_certificate(certificate_der: &[u8]) -> Self {
        let digest = Sha256::digest(certificate_der);
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Hash function name
    pub fn algorithm(&self) -> &'static str {
        FINGERPRINT_ALGORITHM
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Uppercase colon separated hex, without the algorithm prefix
    pub fn hex(&self) -> String {
        self.0
            .iter()
            .map(|byte| format!("{:02X}", byte))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Whether this fingerprint identifies the given certificate
    pub fn matches(&self, certificate_der: &[u8]) -> bool {
        *self == Self::of_certificate(certificate_der)
    }

    /// Parse the colon separated hex part of a fingerprint
    pub fn from_hex(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.trim().split(':').collect();
        if parts.len() != FINGERPRINT_LEN {
            return Err(Error::InvalidParameter(format!(
                "Fingerprint must have {} bytes, got {}",
                FINGERPRINT_LEN,
                parts.len()
            )));
        }
        let mut bytes = [0u8; FINGERPRINT_LEN];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(Error::InvalidParameter(format!("Invalid fingerprint byte: {}", part)));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidParameter(format!("Invalid fingerprint byte: {}", part)))?;
        }
        Ok(Self(bytes))
    }
}

/// Parses `sha-256 AB:CD:...`
impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, value) = s
            .trim()
            .split_once(' ')
            .ok_or_else(|| Error::InvalidParameter(format!("Invalid fingerprint: {}", s)))?;
        if !algorithm.eq_ignore_ascii_case(FINGERPRINT_ALGORITHM) {
            return Err(Error::InvalidParameter(format!(
                "Unsupported fingerprint algorithm: {}",
                algorithm
            )));
        }
        Self::from_hex(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", FINGERPRINT_ALGORITHM, self.hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Self-signed certificate and the P-256 key it certifies
#[derive(Clone)]
pub struct DtlsIdentity {
    certificate: Vec<u8>,
    signing_key: SigningKey,
    fingerprint: Fingerprint,
}

impl DtlsIdentity {
    /// Generate a fresh key pair and self-signed certificate
    pub fn generate() -> Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["peerlink".to_string()])
            .map_err(|e| Error::CertificateError(format!("Failed to generate certificate: {}", e)))?;

        let certificate = cert
            .serialize_der()
            .map_err(|e| Error::CertificateError(format!("Failed to serialize certificate: {}", e)))?;

        let signing_key = SigningKey::from_pkcs8_der(&cert.serialize_private_key_der())
            .map_err(|_| Error::CertificateError("Failed to load certificate private key".into()))?;

        let fingerprint = Fingerprint::of_certificate(&certificate);
        Ok(Self { certificate, signing_key, fingerprint })
    }

    /// DER encoded certificate
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Fingerprint advertised in session descriptions
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl fmt::Debug for DtlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}
