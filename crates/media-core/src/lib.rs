//! Media pipeline for the peerlink engine
//!
//! The library is organized into several modules:
//!
//! - `codec`: codec descriptions negotiated per media line
//! - `packetizer`: frame to RTP packet splitting and reassembly
//! - `jitter_buffer`: reordering window over extended sequence numbers
//! - `stats`: RFC 3550 reception and sending statistics
//! - `congestion`: loss based target bitrate control and REMB estimates
//! - `stream`: per media line state
//! - `pipeline`: the SRTP protected send/receive path of a session

mod error;

pub mod codec;
pub mod config;
pub mod congestion;
pub mod events;
pub mod jitter_buffer;
pub mod packetizer;
pub mod pipeline;
pub mod stats;
pub mod stream;

pub use codec::{Codec, MediaKind};
pub use config::MediaConfig;
pub use congestion::{CongestionController, IncomingBitrateEstimator, LossReport, RateDecision};
pub use error::{Error, Result};
pub use events::{MediaEvent, MediaStats, StreamStats};
pub use jitter_buffer::{JitterBuffer, JitterBufferStats, PushOutcome};
pub use packetizer::{Depacketizer, MediaFrame, Packetizer};
pub use pipeline::MediaPipeline;
pub use stats::{ReceiveStatistics, ReceiverStats, SendStatistics, SenderStats};
pub use stream::{MediaStream, StreamConfig};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        Codec, Error, MediaConfig, MediaEvent, MediaFrame, MediaKind, MediaPipeline, MediaStats,
        Result, StreamConfig,
    };
}
