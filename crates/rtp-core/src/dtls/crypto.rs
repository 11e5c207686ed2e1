//! Key schedule and signatures for the DTLS handshake

use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::{EncodedPoint, PublicKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use super::message::{RANDOM_LEN, VERIFY_DATA_LEN};
use crate::error::Error;
use crate::Result;

type HmacSha256 = Hmac<Sha256>;

/// Master secret length (RFC 5246 section 8.1)
pub const MASTER_SECRET_LEN: usize = 48;

pub const LABEL_MASTER_SECRET: &str = "master secret";
pub const LABEL_CLIENT_FINISHED: &str = "client finished";
pub const LABEL_SERVER_FINISHED: &str = "server finished";

/// Exporter label for DTLS-SRTP keying material (RFC 5764 section 4.2)
pub const LABEL_EXTRACTOR_DTLS_SRTP: &str = "EXTRACTOR-dtls_srtp";

/// TLS 1.2 PRF with HMAC-SHA256 (RFC 5246 section 5)
pub fn prf(secret: &[u8], label: &str, seed: &[u8], output_len: usize) -> Result<Vec<u8>> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label.as_bytes());
    label_seed.extend_from_slice(seed);

    let new_mac = || {
        HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::DtlsHandshakeError(format!("Failed to create HMAC: {}", e)))
    };

    // P_SHA256: A(0) = seed, A(i) = HMAC(secret, A(i-1))
    let mut output = Vec::with_capacity(output_len);
    let mut a = label_seed.clone();
    while output.len() < output_len {
        let mut mac = new_mac()?;
        mac.update(&a);
        a = mac.finalize().into_bytes().to_vec();

        let mut mac = new_mac()?;
        mac.update(&a);
        mac.update(&label_seed);
        output.extend_from_slice(&mac.finalize().into_bytes());
    }
    output.truncate(output_len);
    Ok(output)
}

fn randoms(client_random: &[u8; RANDOM_LEN], server_random: &[u8; RANDOM_LEN]) -> Vec<u8> {
    let mut seed = Vec::with_capacity(2 * RANDOM_LEN);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    seed
}

/// Master secret from the ECDH pre-master secret
pub fn master_secret(
    pre_master: &[u8],
    client_random: &[u8; RANDOM_LEN],
    server_random: &[u8; RANDOM_LEN],
) -> Result<Vec<u8>> {
    prf(
        pre_master,
        LABEL_MASTER_SECRET,
        &randoms(client_random, server_random),
        MASTER_SECRET_LEN,
    )
}

/// Finished verify_data over the transcript so far
pub fn verify_data(master: &[u8], label: &str, transcript: &[u8]) -> Result<[u8; VERIFY_DATA_LEN]> {
    let hash = Sha256::digest(transcript);
    let bytes = prf(master, label, &hash, VERIFY_DATA_LEN)?;
    let mut out = [0u8; VERIFY_DATA_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Exported keying material for SRTP
pub fn export_srtp_keying_material(
    master: &[u8],
    client_random: &[u8; RANDOM_LEN],
    server_random: &[u8; RANDOM_LEN],
    len: usize,
) -> Result<Vec<u8>> {
    prf(master, LABEL_EXTRACTOR_DTLS_SRTP, &randoms(client_random, server_random), len)
}

/// Ephemeral P-256 key pair for one handshake
pub struct EcdhKeyPair {
    secret: EphemeralSecret,
    public: Vec<u8>,
}

impl EcdhKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = EncodedPoint::from(secret.public_key()).as_bytes().to_vec();
        Self { secret, public }
    }

    /// SEC1 uncompressed public point
    pub fn public_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Pre-master secret shared with the peer
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<Vec<u8>> {
        let peer = PublicKey::from_sec1_bytes(peer_public)
            .map_err(|_| Error::DtlsHandshakeError("Invalid peer ECDH public key".into()))?;
        let shared = self.secret.diffie_hellman(&peer);
        Ok(shared.raw_secret_bytes().to_vec())
    }
}

/// Sign with the identity key; returns a DER encoded ECDSA signature
pub fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    let signature: Signature = key.sign(message);
    signature.to_der().as_bytes().to_vec()
}

/// Verify a DER encoded ECDSA signature with the public key of a certificate
pub fn verify_with_certificate(certificate_der: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let key = public_key_from_certificate(certificate_der)?;
    let signature = Signature::from_der(signature)
        .map_err(|_| Error::DtlsHandshakeError("Malformed signature".into()))?;
    key.verify(message, &signature)
        .map_err(|_| Error::DtlsHandshakeError("Signature verification failed".into()))
}

/// Extract the P-256 public key from a DER certificate
pub fn public_key_from_certificate(certificate_der: &[u8]) -> Result<VerifyingKey> {
    let (_, cert) = x509_parser::parse_x509_certificate(certificate_der)
        .map_err(|_| Error::CertificateError("Failed to parse certificate".into()))?;
    let spki = cert.public_key();
    VerifyingKey::from_sec1_bytes(spki.subject_public_key.data.as_ref())
        .map_err(|_| Error::CertificateError("Certificate key is not a P-256 public key".into()))
}
