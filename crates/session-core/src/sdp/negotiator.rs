//! Offer/answer state machine (RFC 3264)
//!
//! ```text
//! Stable --set_local(offer)--> HaveLocalOffer --set_remote(answer)--> Stable
//! Stable --set_remote(offer)--> HaveRemoteOffer --set_local(answer)--> Stable
//! ```
//!
//! Every transition back to `Stable` completes a round and yields a
//! [`NegotiationOutcome`]. Out of order calls fail with
//! [`SessionError::InvalidState`] and leave the machine untouched.

use std::fmt;

use ice_core::{IceCandidate, IceCredentials};
use media_core::{Codec, MediaKind, StreamConfig};
use rtp_core::{DtlsRole, Fingerprint, RtpSsrc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::types::{Direction, MediaLine, SdpType, SessionDescription, SetupRole};
use crate::errors::{Result, SessionError};
use crate::types::StreamSpec;

/// Signaling state of the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Codec preferences per media kind, most preferred first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecPreferences {
    pub audio: Vec<Codec>,
    pub video: Vec<Codec>,
}

impl Default for CodecPreferences {
    fn default() -> Self {
        Self {
            audio: Codec::defaults_for(MediaKind::Audio),
            video: Codec::defaults_for(MediaKind::Video),
        }
    }
}

impl CodecPreferences {
    pub fn for_kind(&self, kind: MediaKind) -> &[Codec] {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }
}

/// Transport parameters written into local descriptions
#[derive(Debug, Clone)]
pub struct LocalTransport {
    pub credentials: IceCredentials,
    pub fingerprint: Fingerprint,
    pub candidates: Vec<IceCandidate>,
    pub end_of_candidates: bool,
}

/// Result of a completed offer/answer round
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationOutcome {
    /// Number of this round, starting at 1
    pub round: u64,
    /// Streams of every accepted media line
    pub streams: Vec<StreamConfig>,
    /// Local SSRCs of streams the round dropped
    pub removed: Vec<RtpSsrc>,
    pub remote_credentials: IceCredentials,
    pub remote_fingerprint: Fingerprint,
    /// Candidates carried inside the remote description
    pub remote_candidates: Vec<IceCandidate>,
    pub dtls_role: DtlsRole,
    /// Whether this side sent the offer of the round
    pub is_offerer: bool,
}

#[derive(Debug, Clone)]
struct LocalStream {
    /// Assigned when the stream first appears in a description
    mid: Option<String>,
    kind: MediaKind,
    codecs: Vec<Codec>,
    ssrc: RtpSsrc,
    direction: Direction,
}

impl LocalStream {
    fn media_line(&self, mid: &str) -> MediaLine {
        let mut line = MediaLine::new(mid, self.kind, self.codecs.clone(), self.direction);
        line.ssrc = self.direction.sends().then_some(self.ssrc);
        line
    }
}

/// Offer/answer negotiator of one session
#[derive(Debug)]
pub struct Negotiator {
    state: SignalingState,
    preferences: CodecPreferences,
    session_id: u64,
    version: u64,
    streams: Vec<LocalStream>,
    next_mid: u32,
    pending_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    current_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    accepted: Vec<StreamConfig>,
    completed_rounds: u64,
}

impl Negotiator {
    pub fn new(preferences: CodecPreferences) -> Self {
        Self {
            state: SignalingState::Stable,
            preferences,
            // Leave headroom so the version never overflows the 63 bits
            // other stacks expect
            session_id: rand::random::<u64>() >> 2,
            version: 0,
            streams: Vec::new(),
            next_mid: 0,
            pending_local: None,
            pending_remote: None,
            current_local: None,
            current_remote: None,
            accepted: Vec::new(),
            completed_rounds: 0,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// Offer/answer rounds completed so far
    pub fn completed_rounds(&self) -> u64 {
        self.completed_rounds
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.pending_local.as_ref().or(self.current_local.as_ref())
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.pending_remote.as_ref().or(self.current_remote.as_ref())
    }

    /// Streams accepted by the last completed round
    pub fn accepted_streams(&self) -> &[StreamConfig] {
        &self.accepted
    }

    /// Register a local stream for the next description. Returns its SSRC.
    pub fn add_stream(&mut self, spec: StreamSpec) -> Result<RtpSsrc> {
        self.ensure_open()?;
        let codecs = if spec.codecs.is_empty() {
            self.preferences.for_kind(spec.kind).to_vec()
        } else {
            spec.codecs
        };
        if codecs.is_empty() {
            return Err(SessionError::config(format!("No codecs configured for {}", spec.kind)));
        }
        let ssrc = spec.ssrc.unwrap_or_else(|| self.unused_ssrc());
        if self.streams.iter().any(|s| s.ssrc == ssrc) {
            return Err(SessionError::invalid_state(format!("SSRC {} already in use", ssrc)));
        }

        debug!(kind = %spec.kind, ssrc, "Added local stream");
        self.streams.push(LocalStream {
            mid: None,
            kind: spec.kind,
            codecs,
            ssrc,
            direction: spec.direction,
        });
        Ok(ssrc)
    }

    /// Create an offer from the local streams. Only legal in `Stable`.
    pub fn create_offer(&mut self, transport: &LocalTransport) -> Result<SessionDescription> {
        self.ensure_state(SignalingState::Stable, "create an offer")?;

        // Lines keep their position from the previous round, new ones follow
        let previous: Vec<String> = self
            .current_local
            .as_ref()
            .map(|d| d.media.iter().map(|m| m.mid.clone()).collect())
            .unwrap_or_default();
        let mut order: Vec<usize> = (0..self.streams.len()).collect();
        order.sort_by_key(|&index| {
            let mid = self.streams[index].mid.as_deref();
            previous
                .iter()
                .position(|p| Some(p.as_str()) == mid)
                .unwrap_or(usize::MAX)
        });

        let mut media = Vec::with_capacity(self.streams.len());
        for index in order {
            let mid = match self.streams[index].mid.clone() {
                Some(mid) => mid,
                None => {
                    let mid = self.allocate_mid();
                    self.streams[index].mid = Some(mid.clone());
                    mid
                }
            };
            media.push(self.streams[index].media_line(&mid));
        }

        Ok(self.description(SdpType::Offer, SetupRole::ActPass, transport, media))
    }

    /// Answer the pending remote offer. Only legal in `HaveRemoteOffer`.
    pub fn create_answer(&mut self, transport: &LocalTransport) -> Result<SessionDescription> {
        self.ensure_state(SignalingState::HaveRemoteOffer, "create an answer")?;
        let offer = self
            .pending_remote
            .clone()
            .ok_or_else(|| SessionError::invalid_state("no remote offer"))?;

        let mut media = Vec::with_capacity(offer.media.len());
        for offered in &offer.media {
            if offered.is_rejected() {
                media.push(MediaLine::rejected(offered));
                continue;
            }
            let index = self.stream_for_offered_line(offered);
            let local = &self.streams[index];

            // Offerer's order and payload types, first match wins
            let codecs: Vec<Codec> = offered
                .codecs
                .iter()
                .filter(|c| local.codecs.iter().any(|ours| ours.matches(c)))
                .cloned()
                .collect();
            if codecs.is_empty() {
                debug!(mid = %offered.mid, "No common codec, rejecting media line");
                media.push(MediaLine::rejected(offered));
                continue;
            }

            let direction = Direction::answer(offered.direction, local.direction);
            let mut line = MediaLine::new(offered.mid.clone(), offered.kind, codecs, direction);
            line.ssrc = direction.sends().then_some(local.ssrc);
            media.push(line);
        }

        let setup = match offer.setup {
            SetupRole::Active => SetupRole::Passive,
            SetupRole::ActPass | SetupRole::Passive => SetupRole::Active,
        };
        Ok(self.description(SdpType::Answer, setup, transport, media))
    }

    /// Whether `remote` carries ICE credentials other than those of the
    /// last completed round
    pub fn restarts_ice(&self, remote: &SessionDescription) -> bool {
        self.current_remote
            .as_ref()
            .map_or(false, |previous| previous.ice_ufrag != remote.ice_ufrag)
    }

    /// Apply a local description. Completing a round returns its outcome.
    pub fn set_local(&mut self, description: SessionDescription) -> Result<Option<NegotiationOutcome>> {
        match description.sdp_type {
            SdpType::Offer => {
                self.ensure_state(SignalingState::Stable, "set a local offer")?;
                self.pending_local = Some(description);
                self.transition(SignalingState::HaveLocalOffer);
                Ok(None)
            }
            SdpType::Answer => {
                self.ensure_state(SignalingState::HaveRemoteOffer, "set a local answer")?;
                let offer = self
                    .pending_remote
                    .take()
                    .ok_or_else(|| SessionError::invalid_state("no remote offer"))?;
                if let Err(e) = check_answer(&offer, &description) {
                    self.pending_remote = Some(offer);
                    return Err(e);
                }
                Ok(Some(self.complete_round(offer, description, false)))
            }
        }
    }

    /// Apply a remote description. Completing a round returns its outcome.
    pub fn set_remote(&mut self, description: SessionDescription) -> Result<Option<NegotiationOutcome>> {
        match description.sdp_type {
            SdpType::Offer => {
                self.ensure_state(SignalingState::Stable, "set a remote offer")?;
                self.pending_remote = Some(description);
                self.transition(SignalingState::HaveRemoteOffer);
                Ok(None)
            }
            SdpType::Answer => {
                self.ensure_state(SignalingState::HaveLocalOffer, "set a remote answer")?;
                let offer = self
                    .pending_local
                    .take()
                    .ok_or_else(|| SessionError::invalid_state("no local offer"))?;
                if let Err(e) = check_answer(&offer, &description) {
                    self.pending_local = Some(offer);
                    return Err(e);
                }
                Ok(Some(self.complete_round(offer, description, true)))
            }
        }
    }

    /// Enter `Closed`; every later call fails
    pub fn close(&mut self) {
        self.pending_local = None;
        self.pending_remote = None;
        self.transition(SignalingState::Closed);
    }

    fn complete_round(
        &mut self,
        offer: SessionDescription,
        answer: SessionDescription,
        is_offerer: bool,
    ) -> NegotiationOutcome {
        let (local, remote) = if is_offerer {
            (offer, answer)
        } else {
            (answer, offer)
        };
        let answer = if is_offerer { &remote } else { &local };

        let mut streams = Vec::new();
        for line in answer.active_media() {
            let Some(codec) = line.selected_codec() else { continue };
            let Some(stream) = self.streams.iter().find(|s| s.mid.as_deref() == Some(line.mid.as_str())) else {
                continue;
            };
            // Answer directions are written from the answerer's side
            let (send, receive) = if is_offerer {
                (line.direction.receives(), line.direction.sends())
            } else {
                (line.direction.sends(), line.direction.receives())
            };
            let remote_ssrc = remote.media_line(&line.mid).and_then(|m| m.ssrc);
            streams.push(StreamConfig {
                mid: line.mid.clone(),
                kind: line.kind,
                codec: codec.clone(),
                local_ssrc: stream.ssrc,
                remote_ssrc,
                send,
                receive,
            });
        }

        let removed: Vec<RtpSsrc> = self
            .accepted
            .iter()
            .filter(|old| !streams.iter().any(|s| s.local_ssrc == old.local_ssrc))
            .map(|old| old.local_ssrc)
            .collect();

        let dtls_role = match (is_offerer, answer.setup) {
            (true, SetupRole::Passive) => DtlsRole::Client,
            (true, _) => DtlsRole::Server,
            (false, SetupRole::Passive) => DtlsRole::Server,
            (false, _) => DtlsRole::Client,
        };

        self.completed_rounds += 1;
        let outcome = NegotiationOutcome {
            round: self.completed_rounds,
            streams: streams.clone(),
            removed,
            remote_credentials: IceCredentials::new(remote.ice_ufrag.clone(), remote.ice_pwd.clone()),
            remote_fingerprint: remote.fingerprint,
            remote_candidates: remote.candidates.clone(),
            dtls_role,
            is_offerer,
        };

        info!(
            round = outcome.round,
            streams = streams.len(),
            removed = outcome.removed.len(),
            role = ?dtls_role,
            "Negotiation round complete"
        );
        self.accepted = streams;
        self.current_local = Some(local);
        self.current_remote = Some(remote);
        self.transition(SignalingState::Stable);
        outcome
    }

    fn description(
        &mut self,
        sdp_type: SdpType,
        setup: SetupRole,
        transport: &LocalTransport,
        media: Vec<MediaLine>,
    ) -> SessionDescription {
        self.version += 1;
        SessionDescription {
            sdp_type,
            session_id: self.session_id,
            version: self.version,
            ice_ufrag: transport.credentials.ufrag.clone(),
            ice_pwd: transport.credentials.pwd.clone(),
            fingerprint: transport.fingerprint,
            setup,
            candidates: transport.candidates.clone(),
            end_of_candidates: transport.end_of_candidates,
            media,
        }
    }

    /// Local stream answering an offered line: the one already bound to its
    /// mid, else the first unbound stream of the same kind, else a new
    /// receive-only stream with the default codecs
    fn stream_for_offered_line(&mut self, offered: &MediaLine) -> usize {
        if let Some(index) = self
            .streams
            .iter()
            .position(|s| s.mid.as_deref() == Some(offered.mid.as_str()))
        {
            return index;
        }
        if let Some(index) = self
            .streams
            .iter()
            .position(|s| s.mid.is_none() && s.kind == offered.kind)
        {
            self.streams[index].mid = Some(offered.mid.clone());
            return index;
        }

        let ssrc = self.unused_ssrc();
        debug!(mid = %offered.mid, ssrc, "Creating receive-only stream for remote media line");
        self.streams.push(LocalStream {
            mid: Some(offered.mid.clone()),
            kind: offered.kind,
            codecs: self.preferences.for_kind(offered.kind).to_vec(),
            ssrc,
            direction: Direction::RecvOnly,
        });
        self.streams.len() - 1
    }

    fn allocate_mid(&mut self) -> String {
        loop {
            let mid = self.next_mid.to_string();
            self.next_mid += 1;
            if !self.streams.iter().any(|s| s.mid.as_deref() == Some(mid.as_str())) {
                return mid;
            }
        }
    }

    fn unused_ssrc(&self) -> RtpSsrc {
        loop {
            let ssrc = rand::random::<RtpSsrc>();
            if ssrc != 0 && !self.streams.iter().any(|s| s.ssrc == ssrc) {
                return ssrc;
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == SignalingState::Closed {
            return Err(SessionError::invalid_state("session is closed"));
        }
        Ok(())
    }

    fn ensure_state(&self, expected: SignalingState, action: &str) -> Result<()> {
        self.ensure_open()?;
        if self.state != expected {
            return Err(SessionError::invalid_state(format!(
                "cannot {} in state {}",
                action, self.state
            )));
        }
        Ok(())
    }

    fn transition(&mut self, next: SignalingState) {
        if self.state != next {
            debug!("Signaling state {} -> {}", self.state, next);
            self.state = next;
        }
    }
}

/// An answer must mirror the offer's media lines in order
fn check_answer(offer: &SessionDescription, answer: &SessionDescription) -> Result<()> {
    if offer.media.len() != answer.media.len() {
        return Err(SessionError::sdp(format!(
            "Answer has {} media lines, offer has {}",
            answer.media.len(),
            offer.media.len()
        )));
    }
    for (offered, answered) in offer.media.iter().zip(&answer.media) {
        if offered.mid != answered.mid || offered.kind != answered.kind {
            return Err(SessionError::sdp(format!(
                "Answer line {} does not match offer line {}",
                answered.mid, offered.mid
            )));
        }
        if !answered.is_rejected() && answered.codecs.is_empty() {
            return Err(SessionError::sdp(format!("Answer line {} has no codec", answered.mid)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp_core::DtlsIdentity;

    fn transport() -> LocalTransport {
        LocalTransport {
            credentials: IceCredentials::generate(),
            fingerprint: DtlsIdentity::generate().unwrap().fingerprint(),
            candidates: Vec::new(),
            end_of_candidates: false,
        }
    }

    #[test]
    fn test_offer_answer_round() {
        let (ta, tb) = (transport(), transport());
        let mut a = Negotiator::new(CodecPreferences::default());
        let mut b = Negotiator::new(CodecPreferences::default());
        let a_ssrc = a.add_stream(StreamSpec::audio()).unwrap();
        let b_ssrc = b.add_stream(StreamSpec::audio()).unwrap();

        let offer = a.create_offer(&ta).unwrap();
        assert_eq!(offer.setup, SetupRole::ActPass);
        assert_eq!(offer.media[0].mid, "0");
        assert!(a.set_local(offer.clone()).unwrap().is_none());
        assert_eq!(a.state(), SignalingState::HaveLocalOffer);

        assert!(b.set_remote(offer).unwrap().is_none());
        let answer = b.create_answer(&tb).unwrap();
        assert_eq!(answer.setup, SetupRole::Active);
        let b_outcome = b.set_local(answer.clone()).unwrap().unwrap();
        let a_outcome = a.set_remote(answer).unwrap().unwrap();

        assert_eq!(a.state(), SignalingState::Stable);
        assert_eq!(b.state(), SignalingState::Stable);
        assert_eq!((a_outcome.round, b_outcome.round), (1, 1));
        assert_eq!(a_outcome.dtls_role, DtlsRole::Server);
        assert_eq!(b_outcome.dtls_role, DtlsRole::Client);
        assert_eq!(a_outcome.remote_credentials, tb.credentials);
        assert_eq!(b_outcome.remote_fingerprint, ta.fingerprint);

        let stream = &a_outcome.streams[0];
        assert_eq!(stream.codec, Codec::opus());
        assert_eq!((stream.local_ssrc, stream.remote_ssrc), (a_ssrc, Some(b_ssrc)));
        assert!(stream.send && stream.receive);
        assert_eq!(b_outcome.streams[0].remote_ssrc, Some(a_ssrc));
    }

    #[test]
    fn test_codec_intersection_keeps_offerer_order() {
        let mut a = Negotiator::new(CodecPreferences::default());
        let mut b = Negotiator::new(CodecPreferences::default());
        a.add_stream(StreamSpec::audio().with_codecs(vec![
            Codec::pcma(),
            Codec::new(109, "opus", 48_000, 2),
            Codec::pcmu(),
        ]))
        .unwrap();
        b.add_stream(StreamSpec::audio().with_codecs(vec![Codec::opus(), Codec::pcmu()]))
            .unwrap();

        let offer = a.create_offer(&transport()).unwrap();
        a.set_local(offer.clone()).unwrap();
        b.set_remote(offer).unwrap();
        let answer = b.create_answer(&transport()).unwrap();
        assert_eq!(
            answer.media[0].codecs,
            vec![Codec::new(109, "opus", 48_000, 2), Codec::pcmu()]
        );

        let outcome = a.set_remote(answer).unwrap().unwrap();
        assert_eq!(outcome.streams[0].codec.payload_type, 109);
    }

    #[test]
    fn test_line_without_common_codec_rejected() {
        let mut a = Negotiator::new(CodecPreferences::default());
        let mut b = Negotiator::new(CodecPreferences {
            audio: vec![Codec::pcmu()],
            video: vec![Codec::h264()],
        });
        a.add_stream(StreamSpec::audio()).unwrap();
        a.add_stream(StreamSpec::video().with_codecs(vec![Codec::vp8()])).unwrap();

        let offer = a.create_offer(&transport()).unwrap();
        a.set_local(offer.clone()).unwrap();
        b.set_remote(offer).unwrap();
        let answer = b.create_answer(&transport()).unwrap();
        assert!(!answer.media[0].is_rejected());
        assert!(answer.media[1].is_rejected());
        assert_eq!(answer.media[1].direction, Direction::Inactive);

        let outcome = a.set_remote(answer).unwrap().unwrap();
        assert_eq!(outcome.streams.len(), 1);
        assert_eq!(outcome.streams[0].codec, Codec::pcmu());
        // The answerer had no audio stream: it only receives
        assert!(outcome.streams[0].send);
        assert!(!outcome.streams[0].receive);
    }

    #[test]
    fn test_out_of_order_calls_fail() {
        let t = transport();
        let mut a = Negotiator::new(CodecPreferences::default());
        a.add_stream(StreamSpec::audio()).unwrap();

        assert!(matches!(a.create_answer(&t), Err(SessionError::InvalidState(_))));
        let offer = a.create_offer(&t).unwrap();
        a.set_local(offer.clone()).unwrap();
        assert!(matches!(a.set_local(offer.clone()), Err(SessionError::InvalidState(_))));
        assert!(matches!(a.create_offer(&t), Err(SessionError::InvalidState(_))));
        assert!(matches!(a.set_remote(offer), Err(SessionError::InvalidState(_))));
        assert_eq!(a.state(), SignalingState::HaveLocalOffer);
        assert_eq!(a.completed_rounds(), 0);

        a.close();
        assert!(matches!(a.add_stream(StreamSpec::video()), Err(SessionError::InvalidState(_))));
    }

    #[test]
    fn test_mismatched_answer_rejected_without_state_change() {
        let mut a = Negotiator::new(CodecPreferences::default());
        let mut b = Negotiator::new(CodecPreferences::default());
        a.add_stream(StreamSpec::audio()).unwrap();

        let offer = a.create_offer(&transport()).unwrap();
        a.set_local(offer.clone()).unwrap();
        b.set_remote(offer).unwrap();
        let mut answer = b.create_answer(&transport()).unwrap();
        answer.media[0].mid = "7".into();

        assert!(matches!(a.set_remote(answer), Err(SessionError::Sdp(_))));
        assert_eq!(a.state(), SignalingState::HaveLocalOffer);
    }

    #[test]
    fn test_renegotiation_detects_ice_restart_and_keeps_mids() {
        let mut a = Negotiator::new(CodecPreferences::default());
        let mut b = Negotiator::new(CodecPreferences::default());
        a.add_stream(StreamSpec::audio()).unwrap();
        let tb = transport();

        let round = |a: &mut Negotiator, b: &mut Negotiator, ta: &LocalTransport| {
            let offer = a.create_offer(ta).unwrap();
            a.set_local(offer.clone()).unwrap();
            let restart = b.restarts_ice(&offer);
            b.set_remote(offer).unwrap();
            let answer = b.create_answer(&tb).unwrap();
            a.set_remote(answer.clone()).unwrap();
            (restart, b.set_local(answer).unwrap().unwrap())
        };

        let ta = transport();
        let (restart, first) = round(&mut a, &mut b, &ta);
        assert!(!restart);
        assert_eq!(first.round, 1);
        let (restart, _) = round(&mut a, &mut b, &ta);
        assert!(!restart);

        a.add_stream(StreamSpec::video()).unwrap();
        let (restart, second) = round(&mut a, &mut b, &transport());
        assert!(restart);
        assert_eq!(second.round, 3);
        let mids: Vec<&str> = second.streams.iter().map(|s| s.mid.as_str()).collect();
        assert_eq!(mids, vec!["0", "1"]);
        assert!(second.removed.is_empty());
        assert_eq!(a.state(), SignalingState::Stable);
    }

    #[test]
    fn test_answerer_outcome_describes_the_offerer() {
        let (ta, tb) = (transport(), transport());
        let mut a = Negotiator::new(CodecPreferences::default());
        let mut b = Negotiator::new(CodecPreferences::default());
        let a_ssrc = a.add_stream(StreamSpec::audio()).unwrap();
        let b_ssrc = b.add_stream(StreamSpec::audio()).unwrap();

        let offer = a.create_offer(&ta).unwrap();
        a.set_local(offer.clone()).unwrap();
        b.set_remote(offer).unwrap();
        let answer = b.create_answer(&tb).unwrap();
        let outcome = b.set_local(answer).unwrap().unwrap();

        assert_eq!(outcome.remote_credentials, ta.credentials);
        assert_ne!(outcome.remote_credentials, tb.credentials);
        assert_eq!(outcome.remote_fingerprint, ta.fingerprint);
        assert!(!outcome.is_offerer);
        assert_eq!(b.local_description().map(|d| d.sdp_type), Some(SdpType::Answer));
        assert_eq!(b.remote_description().map(|d| d.sdp_type), Some(SdpType::Offer));
        assert_eq!(outcome.streams[0].local_ssrc, b_ssrc);
        assert_eq!(outcome.streams[0].remote_ssrc, Some(a_ssrc));
    }
}
