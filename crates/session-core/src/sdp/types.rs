//! Types for SDP negotiation

use std::fmt;

use ice_core::IceCandidate;
use media_core::{Codec, MediaKind};
use rtp_core::{Fingerprint, RtpSsrc};
use serde::{Deserialize, Serialize};

/// Discard port advertised on media lines; the transport comes from ICE
pub const DISCARD_PORT: u16 = 9;

/// Whether a description is an offer or an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// Media direction attribute of a media line
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    pub fn sends(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }

    pub fn receives(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::RecvOnly)
    }

    /// Answer direction for an offered direction given the local preference
    /// (RFC 3264 section 6.1)
    pub fn answer(offered: Direction, local: Direction) -> Direction {
        Self::from_flags(
            offered.receives() && local.sends(),
            offered.sends() && local.receives(),
        )
    }

    fn from_flags(send: bool, recv: bool) -> Direction {
        match (send, recv) {
            (true, true) => Direction::SendRecv,
            (true, false) => Direction::SendOnly,
            (false, true) => Direction::RecvOnly,
            (false, false) => Direction::Inactive,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DTLS setup attribute (RFC 4145, RFC 5763)
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupRole {
    /// Offerer lets the answerer choose
    ActPass,
    /// Initiates the handshake (DTLS client)
    Active,
    /// Waits for the handshake (DTLS server)
    Passive,
}

impl SetupRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SetupRole::ActPass => "actpass",
            SetupRole::Active => "active",
            SetupRole::Passive => "passive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "actpass" => Some(SetupRole::ActPass),
            "active" => Some(SetupRole::Active),
            "passive" => Some(SetupRole::Passive),
            _ => None,
        }
    }
}

impl fmt::Display for SetupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `m=` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine {
    /// `a=mid` value
    pub mid: String,
    pub kind: MediaKind,
    /// 0 marks a rejected line
    pub port: u16,
    /// Codecs in preference order
    pub codecs: Vec<Codec>,
    pub direction: Direction,
    /// SSRC the sender of this description transmits with
    pub ssrc: Option<RtpSsrc>,
}

impl MediaLine {
    pub fn new(mid: impl Into<String>, kind: MediaKind, codecs: Vec<Codec>, direction: Direction) -> Self {
        Self {
            mid: mid.into(),
            kind,
            port: DISCARD_PORT,
            codecs,
            direction,
            ssrc: None,
        }
    }

    /// A line answered as rejected keeps the offered formats, port 0 and
    /// no direction
    pub fn rejected(offered: &MediaLine) -> Self {
        Self {
            mid: offered.mid.clone(),
            kind: offered.kind,
            port: 0,
            codecs: offered.codecs.clone(),
            direction: Direction::Inactive,
            ssrc: None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }

    /// Codec the line settled on: the first one listed
    pub fn selected_codec(&self) -> Option<&Codec> {
        self.codecs.first()
    }
}

/// A complete session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    /// `o=` session id
    pub session_id: u64,
    /// `o=` session version, incremented for every new local description
    pub version: u64,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: Fingerprint,
    pub setup: SetupRole,
    /// Candidates known when the description was created
    pub candidates: Vec<IceCandidate>,
    /// Whether gathering had finished when the description was created
    pub end_of_candidates: bool,
    pub media: Vec<MediaLine>,
}

impl SessionDescription {
    pub fn media_line(&self, mid: &str) -> Option<&MediaLine> {
        self.media.iter().find(|m| m.mid == mid)
    }

    /// Lines that were not rejected
    pub fn active_media(&self) -> impl Iterator<Item = &MediaLine> {
        self.media.iter().filter(|m| !m.is_rejected())
    }
}
