//! SDP text encoding and decoding of [`SessionDescription`]
//!
//! Only the attributes the engine negotiates are understood. Transport
//! attributes (`ice-ufrag`, `ice-pwd`, `fingerprint`, `setup`, candidates)
//! are accepted at session or media level since every line shares one
//! bundled transport; they are written once at session level.

use std::collections::HashMap;
use std::fmt::{self, Write as _};

use ice_core::IceCandidate;
use media_core::{Codec, MediaKind};
use rtp_core::{Fingerprint, RtpSsrc};
use tracing::trace;

use super::types::{Direction, MediaLine, SdpType, SessionDescription, SetupRole};
use crate::errors::{Result, SessionError};

/// Transport profile written on every media line
const MEDIA_PROTOCOL: &str = "UDP/TLS/RTP/SAVPF";

/// CNAME announced with `a=ssrc`
const CNAME: &str = "peerlink";

/// Media section being collected
struct PendingMedia {
    kind: MediaKind,
    port: u16,
    formats: Vec<u8>,
    mid: Option<String>,
    rtpmap: HashMap<u8, Codec>,
    direction: Option<Direction>,
    ssrc: Option<RtpSsrc>,
}

impl PendingMedia {
    fn parse(value: &str) -> Result<Self> {
        let mut parts = value.split_whitespace();
        let kind = parts
            .next()
            .and_then(MediaKind::parse)
            .ok_or_else(|| SessionError::sdp(format!("Unsupported media line: m={}", value)))?;
        let port = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| SessionError::sdp(format!("Invalid media port: m={}", value)))?;
        // protocol
        parts
            .next()
            .ok_or_else(|| SessionError::sdp(format!("Missing media protocol: m={}", value)))?;
        let formats = parts
            .map(|f| {
                f.parse::<u8>()
                    .map_err(|_| SessionError::sdp(format!("Invalid payload type: {}", f)))
            })
            .collect::<Result<Vec<u8>>>()?;

        Ok(Self {
            kind,
            port,
            formats,
            mid: None,
            rtpmap: HashMap::new(),
            direction: None,
            ssrc: None,
        })
    }

    fn finish(mut self, index: usize) -> MediaLine {
        let codecs = self
            .formats
            .iter()
            .filter_map(|pt| self.rtpmap.remove(pt).or_else(|| static_codec(*pt)))
            .collect();
        MediaLine {
            mid: self.mid.unwrap_or_else(|| index.to_string()),
            kind: self.kind,
            port: self.port,
            codecs,
            direction: self.direction.unwrap_or(Direction::SendRecv),
            ssrc: self.ssrc,
        }
    }
}

/// RFC 3551 static payload types usable without `a=rtpmap`
fn static_codec(payload_type: u8) -> Option<Codec> {
    match payload_type {
        0 => Some(Codec::pcmu()),
        8 => Some(Codec::pcma()),
        _ => None,
    }
}

/// `a=rtpmap:<pt> <name>/<clock>[/<channels>]`
fn parse_rtpmap(value: &str) -> Result<Codec> {
    let invalid = || SessionError::sdp(format!("Invalid rtpmap: {}", value));
    let (pt, encoding) = value.split_once(' ').ok_or_else(invalid)?;
    let payload_type = pt.parse::<u8>().map_err(|_| invalid())?;

    let mut parts = encoding.trim().split('/');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;
    let clock_rate = parts
        .next()
        .and_then(|c| c.parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let channels = match parts.next() {
        Some(c) => c.parse::<u16>().map_err(|_| invalid())?,
        None => 1,
    };
    Ok(Codec::new(payload_type, name, clock_rate, channels))
}

impl SessionDescription {
    /// Parse SDP text. The type travels next to the text in signaling.
    pub fn parse(sdp_type: SdpType, text: &str) -> Result<Self> {
        let mut session_id = None;
        let mut version = 0;
        let mut ice_ufrag = None;
        let mut ice_pwd = None;
        let mut fingerprint = None;
        let mut setup = None;
        let mut candidates = Vec::new();
        let mut end_of_candidates = false;
        let mut media = Vec::new();
        let mut current: Option<PendingMedia> = None;
        let mut saw_version = false;

        for raw in text.lines() {
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| SessionError::sdp(format!("Malformed line: {}", line)))?;

            match key {
                "v" => {
                    if value != "0" {
                        return Err(SessionError::sdp(format!("Unsupported SDP version: {}", value)));
                    }
                    saw_version = true;
                }
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 6 {
                        return Err(SessionError::sdp(format!("Malformed origin: {}", value)));
                    }
                    session_id = parts[1].parse::<u64>().ok();
                    version = parts[2].parse::<u64>().unwrap_or(0);
                }
                "m" => {
                    if let Some(done) = current.take() {
                        media.push(done.finish(media.len()));
                    }
                    current = Some(PendingMedia::parse(value)?);
                }
                "a" => {
                    let (name, arg) = match value.split_once(':') {
                        Some((name, arg)) => (name, Some(arg)),
                        None => (value, None),
                    };
                    match (name, arg) {
                        ("ice-ufrag", Some(arg)) => ice_ufrag = Some(arg.trim().to_string()),
                        ("ice-pwd", Some(arg)) => ice_pwd = Some(arg.trim().to_string()),
                        ("fingerprint", Some(arg)) => {
                            let parsed = arg
                                .parse::<Fingerprint>()
                                .map_err(|e| SessionError::sdp(e.to_string()))?;
                            fingerprint = Some(parsed);
                        }
                        ("setup", Some(arg)) => {
                            setup = Some(
                                SetupRole::parse(arg.trim())
                                    .ok_or_else(|| SessionError::sdp(format!("Invalid setup: {}", arg)))?,
                            );
                        }
                        ("candidate", Some(_)) => candidates.push(IceCandidate::from_sdp_string(value)?),
                        ("end-of-candidates", None) => end_of_candidates = true,
                        _ => {
                            if let Some(pending) = current.as_mut() {
                                apply_media_attribute(pending, name, arg)?;
                            } else {
                                trace!("Ignoring session attribute a={}", value);
                            }
                        }
                    }
                }
                _ => trace!("Ignoring SDP line {}", line),
            }
        }
        if let Some(done) = current.take() {
            media.push(done.finish(media.len()));
        }

        if !saw_version {
            return Err(SessionError::sdp("Missing v= line"));
        }
        let ice_ufrag = ice_ufrag.ok_or_else(|| SessionError::sdp("Missing a=ice-ufrag"))?;
        let ice_pwd = ice_pwd.ok_or_else(|| SessionError::sdp("Missing a=ice-pwd"))?;
        let fingerprint = fingerprint.ok_or_else(|| SessionError::sdp("Missing a=fingerprint"))?;
        let setup = setup.unwrap_or(match sdp_type {
            SdpType::Offer => SetupRole::ActPass,
            SdpType::Answer => SetupRole::Active,
        });

        Ok(Self {
            sdp_type,
            session_id: session_id.ok_or_else(|| SessionError::sdp("Missing o= line"))?,
            version,
            ice_ufrag,
            ice_pwd,
            fingerprint,
            setup,
            candidates,
            end_of_candidates,
            media,
        })
    }

    /// Render as SDP text with CRLF line endings
    pub fn to_sdp_string(&self) -> String {
        self.to_string()
    }
}

fn apply_media_attribute(pending: &mut PendingMedia, name: &str, arg: Option<&str>) -> Result<()> {
    if let Some(direction) = Direction::parse(name) {
        pending.direction = Some(direction);
        return Ok(());
    }
    match (name, arg) {
        ("mid", Some(arg)) => pending.mid = Some(arg.trim().to_string()),
        ("rtpmap", Some(arg)) => {
            let codec = parse_rtpmap(arg)?;
            pending.rtpmap.insert(codec.payload_type, codec);
        }
        ("ssrc", Some(arg)) => {
            let id = arg.split_whitespace().next().unwrap_or_default();
            let ssrc = id
                .parse::<RtpSsrc>()
                .map_err(|_| SessionError::sdp(format!("Invalid ssrc: {}", arg)))?;
            pending.ssrc.get_or_insert(ssrc);
        }
        _ => trace!("Ignoring media attribute a={}", name),
    }
    Ok(())
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let mut line = |s: String| {
            out.push_str(&s);
            out.push_str("\r\n");
        };

        line("v=0".into());
        line(format!("o=- {} {} IN IP4 0.0.0.0", self.session_id, self.version));
        line("s=-".into());
        line("t=0 0".into());
        let mids: Vec<&str> = self.active_media().map(|m| m.mid.as_str()).collect();
        if !mids.is_empty() {
            line(format!("a=group:BUNDLE {}", mids.join(" ")));
        }
        line(format!("a=ice-ufrag:{}", self.ice_ufrag));
        line(format!("a=ice-pwd:{}", self.ice_pwd));
        line(format!("a=fingerprint:{}", self.fingerprint));
        line(format!("a=setup:{}", self.setup));
        for candidate in &self.candidates {
            line(format!("a={}", candidate.to_sdp_string()));
        }
        if self.end_of_candidates {
            line("a=end-of-candidates".into());
        }

        for media in &self.media {
            let mut formats = String::new();
            for codec in &media.codecs {
                let _ = write!(formats, " {}", codec.payload_type);
            }
            if formats.is_empty() {
                // A media line needs at least one format
                formats.push_str(" 0");
            }
            line(format!("m={} {} {}{}", media.kind, media.port, MEDIA_PROTOCOL, formats));
            line("c=IN IP4 0.0.0.0".into());
            line(format!("a=mid:{}", media.mid));
            line(format!("a={}", media.direction));
            line("a=rtcp-mux".into());
            for codec in &media.codecs {
                line(format!("a=rtpmap:{} {}", codec.payload_type, codec.rtpmap()));
            }
            if let Some(ssrc) = media.ssrc {
                line(format!("a=ssrc:{} cname:{}", ssrc, CNAME));
            }
        }

        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp_core::DtlsIdentity;
    use std::net::SocketAddr;

    fn sample() -> SessionDescription {
        let identity = DtlsIdentity::generate().unwrap();
        let mut audio = MediaLine::new("0", MediaKind::Audio, vec![Codec::opus(), Codec::pcmu()], Direction::SendRecv);
        audio.ssrc = Some(0x1234_5678);
        let video = MediaLine::new("1", MediaKind::Video, vec![Codec::vp8()], Direction::RecvOnly);
        let host: SocketAddr = "192.0.2.10:50000".parse().unwrap();

        SessionDescription {
            sdp_type: SdpType::Offer,
            session_id: 4242,
            version: 2,
            ice_ufrag: "abcd1234".into(),
            ice_pwd: "passwordpasswordpassword".into(),
            fingerprint: identity.fingerprint(),
            setup: SetupRole::ActPass,
            candidates: vec![IceCandidate::host(host, 1, 65535)],
            end_of_candidates: true,
            media: vec![audio, video],
        }
    }

    #[test]
    fn test_written_description_parses_back() {
        let description = sample();
        let text = description.to_sdp_string();
        assert!(text.starts_with("v=0\r\n"));
        assert!(text.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n"));
        assert!(text.contains("a=rtpmap:111 opus/48000/2\r\n"));
        assert!(text.contains("a=group:BUNDLE 0 1\r\n"));

        let parsed = SessionDescription::parse(SdpType::Offer, &text).unwrap();
        assert_eq!(parsed, description);
    }

    #[test]
    fn test_static_payload_types_without_rtpmap() {
        let fingerprint = sample().fingerprint;
        let text = format!(
            "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n\
             a=ice-ufrag:u\r\na=ice-pwd:p\r\na=fingerprint:{}\r\n\
             m=audio 9 RTP/AVP 8 0 101\r\na=sendonly\r\n",
            fingerprint
        );
        let parsed = SessionDescription::parse(SdpType::Offer, &text).unwrap();
        let line = &parsed.media[0];
        assert_eq!(line.mid, "0");
        assert_eq!(line.direction, Direction::SendOnly);
        // 101 has no rtpmap and no static meaning
        assert_eq!(line.codecs, vec![Codec::pcma(), Codec::pcmu()]);
        assert_eq!(parsed.setup, SetupRole::ActPass);
        assert!(!parsed.end_of_candidates);
    }

    #[test]
    fn test_missing_transport_attributes_rejected() {
        let text = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=audio 9 RTP/AVP 0\r\n";
        let err = SessionDescription::parse(SdpType::Offer, text).unwrap_err();
        assert_eq!(err, SessionError::sdp("Missing a=ice-ufrag"));

        let err = SessionDescription::parse(SdpType::Offer, "o=- 1 1 IN IP4 0.0.0.0\r\n").unwrap_err();
        assert!(matches!(err, SessionError::Sdp(_)));
    }

    #[test]
    fn test_unsupported_media_kind_rejected() {
        let text = sample()
            .to_sdp_string()
            .replace("m=video 9", "m=application 9");
        assert!(SessionDescription::parse(SdpType::Offer, &text).is_err());
    }

    #[test]
    fn test_rejected_line_keeps_formats() {
        let mut description = sample();
        description.media[1] = MediaLine::rejected(&description.media[1]);
        let text = description.to_sdp_string();
        assert!(text.contains("m=video 0 UDP/TLS/RTP/SAVPF 96\r\n"));
        assert!(text.contains("a=group:BUNDLE 0\r\n"));

        let parsed = SessionDescription::parse(SdpType::Offer, &text).unwrap();
        assert!(parsed.media[1].is_rejected());
        assert_eq!(parsed.active_media().count(), 1);
    }
}
