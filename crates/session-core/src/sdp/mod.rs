//! Session descriptions and the offer/answer exchange
//!
//! - `types`: the description model (media lines, directions, setup roles)
//! - `parser`: SDP text encoding and decoding
//! - `negotiator`: the RFC 3264 state machine producing negotiated streams

pub mod negotiator;
mod parser;
pub mod types;

pub use negotiator::{CodecPreferences, LocalTransport, NegotiationOutcome, Negotiator, SignalingState};
pub use types::{Direction, MediaLine, SdpType, SessionDescription, SetupRole, DISCARD_PORT};
