//! Session controller
//!
//! Sequences negotiation, connectivity, the DTLS handshake and the media
//! pipeline for one peer session.

mod connect;
mod session;
mod transport;

pub use session::PeerSession;
