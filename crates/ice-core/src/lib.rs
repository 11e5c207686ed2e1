//! ICE (Interactive Connectivity Establishment) transport for peerlink.
//!
//! This crate implements the parts of RFC 8445 a single-stream, RTCP-muxed
//! media session needs: host, server-reflexive and relay gathering, ordered
//! connectivity checks with STUN short-term credentials, regular nomination,
//! consent freshness, and a datagram byte stream over the selected pair.

// Error handling
pub mod error;

// Core STUN protocol implementation
pub mod stun;

// ICE candidates and candidate pairs
pub mod candidate;
pub mod checklist;

// Configuration
pub mod config;

// Gathering and client transactions
mod gather;
mod transaction;

// ICE agent and the byte stream it exposes
pub mod agent;
pub mod transport;

// Public exports
pub use agent::{IceAgent, IceAgentEvent, IceAgentState, IceAgentStats, IceCredentials};
pub use candidate::{CandidateType, IceCandidate, TransportType};
pub use checklist::{CandidatePair, CandidatePairState, Checklist};
pub use config::{GatheringPolicy, IceComponent, IceConfig, IceRole, IceServerConfig};
pub use error::{Error, Result};
pub use stun::{StunAttribute, StunAttributeType, StunClass, StunMessage, StunMessageType};
pub use transport::IceTransport;

/// Re-export of common types and functions
pub mod prelude {
    pub use super::{
        CandidateType, Error, GatheringPolicy, IceAgent, IceAgentEvent, IceAgentState, IceCandidate,
        IceComponent, IceConfig, IceCredentials, IceRole, IceServerConfig, IceTransport, Result,
        StunAttribute, StunMessage, TransportType,
    };
}

/// ICE protocol constants
pub mod constants {
    pub use crate::stun::STUN_MAGIC_COOKIE;

    /// Default port for STUN servers
    pub const DEFAULT_STUN_PORT: u16 = 3478;

    /// Default port for TURNS servers
    pub const DEFAULT_TURNS_PORT: u16 = 5349;
}
