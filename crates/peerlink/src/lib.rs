//! # peerlink - peer-to-peer real-time media for Rust
//!
//! peerlink connects two endpoints for secured audio and video over UDP.
//! It is composed of several core components:
//!
//! - **ICE Core**: STUN codec, candidate gathering, connectivity checks and consent freshness
//! - **RTP Core**: RTP/RTCP packets, SRTP protection and the DTLS-SRTP handshake
//! - **Media Core**: packetization, jitter buffering, RTCP reporting and congestion control
//! - **Session Core**: offer/answer negotiation and the session controller
//! - **Infra Common**: logging setup, layered configuration and task lifecycle
//!
//! ## Quick Start
//!
//! ```no_run
//! use peerlink::prelude::*;
//!
//! # async fn run() -> peerlink::session_core::Result<()> {
//! let session = PeerSession::create(SessionConfig::loopback()).await?;
//! session.add_stream(StreamSpec::audio()).await?;
//! let offer = session.create_offer().await?;
//! session.set_local_description(offer.clone()).await?;
//! // Send `offer` to the peer over any signaling channel
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Structure
//!
//! - [`session_core`]: sessions, descriptions and signaling
//! - [`ice_core`]: the ICE agent and its transport
//! - [`rtp_core`]: packets, SRTP and DTLS
//! - [`media_core`]: the media pipeline
//! - [`infra_common`]: shared infrastructure

#![warn(rust_2018_idioms)]

pub use ice_core;
pub use infra_common;
pub use media_core;
pub use rtp_core;
pub use session_core;

pub mod prelude {
    //! Common imports for peerlink applications

    pub use crate::infra_common::{setup_logging, LoggingConfig};
    pub use crate::session_core::prelude::*;
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
