//! RTP core library for the peerlink engine
//!
//! The library is organized into several modules:
//!
//! - `packet`: RTP and RTCP packet definitions and processing
//! - `dtls`: DTLS-SRTP handshake over an established datagram path
//! - `srtp`: Secure RTP/RTCP protection with keys exported by the handshake
//! - `stats`: round-trip time estimation from RTCP report blocks

mod error;

// Main modules
pub mod dtls;
pub mod packet;
pub mod srtp;
pub mod stats;

// Re-export core types
pub use error::Error;

pub use dtls::{DatagramTransport, DtlsConfig, DtlsIdentity, DtlsRole, DtlsSession, Fingerprint};
pub use packet::rtcp::{
    NtpTimestamp, RtcpPacket, RtcpReceiverReport, RtcpRemb, RtcpReportBlock, RtcpSenderReport,
};
pub use packet::{RtpHeader, RtpPacket};
pub use srtp::{SrtpKeyingMaterial, SrtpProfile, SrtpSession};
pub use stats::RttEstimator;

/// The default maximum size for RTP packets in bytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

/// Typedef for RTP timestamp values
pub type RtpTimestamp = u32;

/// Typedef for RTP sequence numbers
pub type RtpSequenceNumber = u16;

/// Typedef for RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Typedef for RTP contributing source identifier
pub type RtpCsrc = u32;

/// Result type for RTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        DatagramTransport, DtlsConfig, DtlsIdentity, DtlsRole, Error, Fingerprint, Result,
        RtpCsrc, RtpHeader, RtpPacket, RtpSequenceNumber, RtpSsrc, RtpTimestamp, SrtpSession,
    };

    pub use crate::packet::rtcp::{
        NtpTimestamp, RtcpPacket, RtcpReceiverReport, RtcpRemb, RtcpReportBlock, RtcpSenderReport,
    };
}
