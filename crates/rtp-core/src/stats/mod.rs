//! RTP statistics helpers
//!
//! Round-trip time is derived from the LSR/DLSR fields of report blocks
//! (RFC 3550 section 6.4.1). Per-stream reception statistics live with the
//! media pipeline, which owns the streams.

pub mod rtt;

pub use rtt::{RttEstimator, RttStats};
