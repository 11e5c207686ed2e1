use std::io;
use thiserror::Error;

/// Error type for RTP, SRTP and DTLS operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Error when encoding a packet
    #[error("Failed to encode packet: {0}")]
    EncodeError(String),

    /// Invalid packet format
    #[error("Invalid RTP packet format: {0}")]
    InvalidPacket(String),

    /// Buffer too small
    #[error("Buffer too small for RTP packet: need {required} but have {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// Invalid parameter for an operation
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// RTCP error
    #[error("RTCP error: {0}")]
    RtcpError(String),

    /// SRTP error
    #[error("SRTP error: {0}")]
    SrtpError(String),

    /// SRTP/SRTCP authentication tag did not verify
    #[error("SRTP authentication failed for SSRC {0:#010x}")]
    AuthenticationFailed(u32),

    /// Packet index already seen or older than the replay window
    #[error("Replayed packet for SSRC {ssrc:#010x} at index {index}")]
    ReplayedPacket { ssrc: u32, index: u64 },

    /// Certificate generation or parsing failed
    #[error("Certificate error: {0}")]
    CertificateError(String),

    /// DTLS handshake failure
    #[error("DTLS handshake failed: {0}")]
    DtlsHandshakeError(String),

    /// Peer certificate does not match the fingerprint from its description
    #[error("Certificate fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// No answer after every retransmission of a flight
    #[error("DTLS handshake timed out after {0} transmissions")]
    HandshakeTimeout(usize),

    /// Peer aborted the handshake with a fatal alert
    #[error("DTLS alert received: {0}")]
    AlertReceived(u8),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl Error {
    /// Whether this error came out of the DTLS handshake or certificate checks
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Error::CertificateError(_)
                | Error::DtlsHandshakeError(_)
                | Error::FingerprintMismatch { .. }
                | Error::HandshakeTimeout(_)
                | Error::AlertReceived(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
