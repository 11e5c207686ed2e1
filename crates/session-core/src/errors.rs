//! Error types for session core
//!
//! The variants follow the failure classes a peer session can surface:
//! sequencing mistakes by the caller, lost connectivity, failed security and
//! concurrent negotiation attempts. Lower layer errors convert into the class
//! they belong to.

use thiserror::Error;

/// Main result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Main error type for session operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Operation called out of order; retry in the right state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No viable transport path
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Handshake or fingerprint failure
    #[error("Security error: {0}")]
    Security(String),

    /// Another negotiation operation is running
    #[error("Negotiation already in progress")]
    NegotiationInProgress,

    /// Malformed or unusable session description
    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket or channel failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl SessionError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SessionError::InvalidState(msg.into())
    }

    pub fn sdp(msg: impl Into<String>) -> Self {
        SessionError::Sdp(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SessionError::Config(msg.into())
    }

    /// Whether the error ends the session until a renegotiation
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::Connectivity(_) | SessionError::Security(_))
    }

    /// Whether retrying the same call later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidState(_) | SessionError::NegotiationInProgress
        )
    }
}

impl From<ice_core::Error> for SessionError {
    fn from(err: ice_core::Error) -> Self {
        match err {
            ice_core::Error::InvalidState(msg) => SessionError::InvalidState(msg),
            ice_core::Error::ConfigError(msg) => SessionError::Config(msg),
            ice_core::Error::InvalidCandidate(msg) => SessionError::Sdp(msg),
            ice_core::Error::Io(e) => SessionError::Io(e.to_string()),
            other => SessionError::Connectivity(other.to_string()),
        }
    }
}

impl From<rtp_core::Error> for SessionError {
    fn from(err: rtp_core::Error) -> Self {
        if err.is_handshake_failure() {
            SessionError::Security(err.to_string())
        } else {
            match err {
                rtp_core::Error::Transport(msg) => SessionError::Connectivity(msg),
                rtp_core::Error::InvalidParameter(msg) => SessionError::Sdp(msg),
                other => SessionError::Security(other.to_string()),
            }
        }
    }
}

impl From<media_core::Error> for SessionError {
    fn from(err: media_core::Error) -> Self {
        match err {
            media_core::Error::Rtp(e) => e.into(),
            media_core::Error::InvalidConfig(msg) => SessionError::Config(msg),
            media_core::Error::Transport(msg) => SessionError::Connectivity(msg),
            media_core::Error::Stopped => SessionError::invalid_state("media pipeline stopped"),
            other => SessionError::InvalidState(other.to_string()),
        }
    }
}

impl From<infra_common::Error> for SessionError {
    fn from(err: infra_common::Error) -> Self {
        SessionError::Config(err.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SessionError::Connectivity("no pair".into()).is_terminal());
        assert!(SessionError::Security("bad cert".into()).is_terminal());
        assert!(!SessionError::NegotiationInProgress.is_terminal());
        assert!(SessionError::NegotiationInProgress.is_recoverable());
        assert!(SessionError::invalid_state("twice").is_recoverable());
        assert!(!SessionError::sdp("garbage").is_recoverable());
    }

    #[test]
    fn test_lower_layer_conversions() {
        let err: SessionError = ice_core::Error::ConnectivityError("timeout".into()).into();
        assert!(matches!(err, SessionError::Connectivity(_)));

        let err: SessionError = rtp_core::Error::HandshakeTimeout(6).into();
        assert!(matches!(err, SessionError::Security(_)));

        let err: SessionError = rtp_core::Error::FingerprintMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(err.is_terminal());

        let err: SessionError = media_core::Error::Transport("closed".into()).into();
        assert!(matches!(err, SessionError::Connectivity(_)));
    }
}
