//! DTLS alert protocol implementation
//!
//! This module handles the alert protocol for DTLS.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::Result;

/// DTLS alert level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertLevel {
    /// Warning alert (not fatal)
    Warning = 1,

    /// Fatal alert (connection must be terminated)
    Fatal = 2,
}

impl TryFrom<u8> for AlertLevel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(AlertLevel::Warning),
            2 => Ok(AlertLevel::Fatal),
            other => Err(Error::InvalidPacket(format!("Invalid alert level: {}", other))),
        }
    }
}

/// DTLS alert description (the subset this handshake sends or acts on)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDescription {
    /// Close notification (sent when closing connection)
    CloseNotify,

    /// Unexpected message received
    UnexpectedMessage,

    /// Handshake failure, e.g. no common SRTP profile
    HandshakeFailure,

    /// Certificate does not match the negotiated fingerprint
    BadCertificate,

    /// Illegal parameter
    IllegalParameter,

    /// Decode error
    DecodeError,

    /// Signature or verify data check failed
    DecryptError,

    /// Internal error
    InternalError,

    /// Any description we do not model
    Other(u8),
}

impl AlertDescription {
    pub fn code(&self) -> u8 {
        match self {
            AlertDescription::CloseNotify => 0,
            AlertDescription::UnexpectedMessage => 10,
            AlertDescription::HandshakeFailure => 40,
            AlertDescription::BadCertificate => 42,
            AlertDescription::IllegalParameter => 47,
            AlertDescription::DecodeError => 50,
            AlertDescription::DecryptError => 51,
            AlertDescription::InternalError => 80,
            AlertDescription::Other(code) => *code,
        }
    }
}

impl From<u8> for AlertDescription {
    fn from(value: u8) -> Self {
        match value {
            0 => AlertDescription::CloseNotify,
            10 => AlertDescription::UnexpectedMessage,
            40 => AlertDescription::HandshakeFailure,
            42 => AlertDescription::BadCertificate,
            47 => AlertDescription::IllegalParameter,
            50 => AlertDescription::DecodeError,
            51 => AlertDescription::DecryptError,
            80 => AlertDescription::InternalError,
            other => AlertDescription::Other(other),
        }
    }
}

/// DTLS alert message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alert {
    /// Alert level
    pub level: AlertLevel,

    /// Alert description
    pub description: AlertDescription,
}

impl Alert {
    /// Create a new alert message
    pub fn new(level: AlertLevel, description: AlertDescription) -> Self {
        Self { level, description }
    }

    /// Create a fatal alert
    pub fn fatal(description: AlertDescription) -> Self {
        Self::new(AlertLevel::Fatal, description)
    }

    /// Create a close notify alert
    pub fn close_notify() -> Self {
        Self::new(AlertLevel::Warning, AlertDescription::CloseNotify)
    }

    /// Check if this is a fatal alert
    pub fn is_fatal(&self) -> bool {
        self.level == AlertLevel::Fatal
    }

    /// Serialize the alert to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u8(self.level as u8);
        buf.put_u8(self.description.code());
        buf.freeze()
    }

    /// Parse an alert from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::InvalidPacket(format!("Alert too short: {} bytes", data.len())));
        }
        Ok(Self {
            level: AlertLevel::try_from(data[0])?,
            description: AlertDescription::from(data[1]),
        })
    }
}
