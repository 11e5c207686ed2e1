//! Session core for the peerlink engine
//!
//! A [`PeerSession`] is the single entry point an application drives:
//!
//! - `sdp`: session descriptions and the offer/answer state machine
//! - `coordinator`: the session controller tying ICE, DTLS-SRTP and media together
//! - `signaling`: the channel abstraction descriptions and candidates travel over
//! - `config`: layered session configuration
//! - `events`: lifecycle, candidate and media events
//!
//! ```no_run
//! use session_core::prelude::*;
//!
//! # async fn run() -> session_core::Result<()> {
//! let offerer = PeerSession::create(SessionConfig::loopback()).await?;
//! let answerer = PeerSession::create(SessionConfig::loopback()).await?;
//! offerer.add_stream(StreamSpec::audio()).await?;
//! answerer.add_stream(StreamSpec::audio()).await?;
//!
//! let offer = offerer.create_offer().await?;
//! offerer.set_local_description(offer.clone()).await?;
//! answerer.set_remote_description(offer).await?;
//! let answer = answerer.create_answer().await?;
//! answerer.set_local_description(answer.clone()).await?;
//! offerer.set_remote_description(answer).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod sdp;
pub mod signaling;
pub mod types;

pub use config::SessionConfig;
pub use coordinator::PeerSession;
pub use errors::{Result, SessionError};
pub use events::{SessionEvent, SessionStats};
pub use sdp::{
    CodecPreferences, Direction, MediaLine, NegotiationOutcome, Negotiator, SdpType, SessionDescription,
    SetupRole, SignalingState,
};
pub use signaling::{LoopbackSignaling, SignalMessage, SignalingChannel};
pub use types::{SessionId, SessionState, StreamSpec};

/// Commonly used types
pub mod prelude {
    pub use crate::{
        CodecPreferences, Direction, LoopbackSignaling, PeerSession, Result, SdpType, SessionConfig,
        SessionDescription, SessionError, SessionEvent, SessionId, SessionState, SessionStats,
        SignalMessage, SignalingChannel, StreamSpec,
    };
    pub use media_core::{Codec, MediaFrame, MediaKind};
}
