//! Codec descriptors
//!
//! The engine never encodes or decodes media itself; a codec here is only
//! the RTP payload mapping negotiated in `a=rtpmap` lines (RFC 3551 static
//! types or dynamic types 96..=127).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of media carried on a media line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTP payload format of a codec
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Codec {
    /// RTP payload type
    pub payload_type: u8,

    /// Encoding name as it appears in `a=rtpmap`
    pub name: String,

    /// RTP clock rate in Hz
    pub clock_rate: u32,

    /// Audio channel count, 1 when absent from `a=rtpmap`
    #[serde(default = "default_channels")]
    pub channels: u16,
}

fn default_channels() -> u16 {
    1
}

impl Codec {
    pub fn new(payload_type: u8, name: impl Into<String>, clock_rate: u32, channels: u16) -> Self {
        Self {
            payload_type,
            name: name.into(),
            clock_rate,
            channels,
        }
    }

    /// Opus at its dynamic payload type, always advertised as stereo
    pub fn opus() -> Self {
        Self::new(111, "opus", 48_000, 2)
    }

    /// G.711 mu-law
    pub fn pcmu() -> Self {
        Self::new(0, "PCMU", 8_000, 1)
    }

    /// G.711 A-law
    pub fn pcma() -> Self {
        Self::new(8, "PCMA", 8_000, 1)
    }

    pub fn vp8() -> Self {
        Self::new(96, "VP8", 90_000, 1)
    }

    pub fn h264() -> Self {
        Self::new(102, "H264", 90_000, 1)
    }

    /// Default codec preferences for a media kind
    pub fn defaults_for(kind: MediaKind) -> Vec<Codec> {
        match kind {
            MediaKind::Audio => vec![Self::opus(), Self::pcmu(), Self::pcma()],
            MediaKind::Video => vec![Self::vp8(), Self::h264()],
        }
    }

    /// Whether two descriptors name the same format. Payload types are
    /// local to a description and do not take part in the match.
    pub fn matches(&self, other: &Codec) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.clock_rate == other.clock_rate
            && self.channels == other.channels
    }

    /// `a=rtpmap` value without the payload type, e.g. `opus/48000/2`
    pub fn rtpmap(&self) -> String {
        if self.channels > 1 {
            format!("{}/{}/{}", self.name, self.clock_rate, self.channels)
        } else {
            format!("{}/{}", self.name, self.clock_rate)
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.payload_type, self.rtpmap())
    }
}
