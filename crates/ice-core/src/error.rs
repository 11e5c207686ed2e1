use std::io;
use thiserror::Error;

/// Error type for ICE operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unexpected STUN message
    #[error("STUN error: {0}")]
    StunError(String),

    /// MESSAGE-INTEGRITY did not verify with the expected key
    #[error("STUN message integrity check failed")]
    IntegrityCheckFailed,

    /// FINGERPRINT attribute did not match the message
    #[error("STUN fingerprint mismatch")]
    FingerprintMismatch,

    /// Candidate line could not be parsed or is not usable
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    /// A STUN/TURN server could not be used for gathering
    #[error("Gathering error: {0}")]
    GatheringError(String),

    /// No candidate pair could be validated
    #[error("Connectivity error: {0}")]
    ConnectivityError(String),

    /// A STUN transaction exhausted its retransmissions
    #[error("STUN transaction timed out after {0} attempts")]
    TransactionTimeout(u32),

    /// Peer answered a check with 487 Role Conflict
    #[error("ICE role conflict")]
    RoleConflict,

    /// Operation called in the wrong agent state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Agent has been closed
    #[error("ICE agent closed")]
    Closed,

    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error means the transport can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConnectivityError(_) | Error::Closed)
    }
}

/// Result type for ICE operations
pub type Result<T> = std::result::Result<T, Error>;
