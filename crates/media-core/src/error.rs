use thiserror::Error;

/// Result type for media operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for media operations
#[derive(Debug, Error)]
pub enum Error {
    /// Packet parsing, SRTP or RTCP failure from the RTP layer
    #[error("RTP error: {0}")]
    Rtp(#[from] rtp_core::Error),

    /// No stream is registered for this SSRC
    #[error("Unknown stream: SSRC {0:#010x}")]
    UnknownStream(u32),

    /// Stream exists but is not negotiated for this direction
    #[error("Stream {0:#010x} is not negotiated for sending")]
    NotSending(u32),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Transport used by the pipeline failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Pipeline has been stopped
    #[error("Media pipeline stopped")]
    Stopped,
}

impl Error {
    /// Whether the error came from a packet that failed SRTP authentication
    /// or replay checks, which is expected on hostile or lossy paths
    pub fn is_packet_rejection(&self) -> bool {
        matches!(
            self,
            Error::Rtp(rtp_core::Error::AuthenticationFailed(_))
                | Error::Rtp(rtp_core::Error::ReplayedPacket { .. })
        )
    }
}
