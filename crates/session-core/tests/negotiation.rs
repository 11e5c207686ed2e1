//! Offer/answer sequences driven through two negotiators

use ice_core::IceCredentials;
use media_core::MediaKind;
use proptest::prelude::*;
use rtp_core::Fingerprint;
use session_core::sdp::{CodecPreferences, LocalTransport, Negotiator, SdpType, SignalingState};
use session_core::{SessionError, StreamSpec};

struct Peer {
    negotiator: Negotiator,
    transport: LocalTransport,
    /// Transitions into `Stable` observed from the outside
    stable_entries: u64,
}

impl Peer {
    fn new(name: &[u8]) -> Self {
        Self {
            negotiator: Negotiator::new(CodecPreferences::default()),
            transport: LocalTransport {
                credentials: IceCredentials::generate(),
                fingerprint: Fingerprint::of_certificate(name),
                candidates: Vec::new(),
                end_of_candidates: true,
            },
            stable_entries: 0,
        }
    }

    fn observe<T>(&mut self, step: impl FnOnce(&mut Negotiator, &LocalTransport) -> T) -> T {
        let before = self.negotiator.state();
        let result = step(&mut self.negotiator, &self.transport);
        if before != SignalingState::Stable && self.negotiator.state() == SignalingState::Stable {
            self.stable_entries += 1;
        }
        result
    }
}

#[derive(Debug, Clone)]
enum Step {
    /// A full round, optionally adding a stream on the offerer first
    Round { a_offers: bool, add: Option<MediaKind> },
    /// The offerer applies its offer twice before the round completes
    DoubleLocal { a_offers: bool },
    /// Calls that are illegal in `Stable`
    Stray { on_a: bool },
}

fn step_strategy() -> impl Strategy<Value = Step> {
    let kind = prop_oneof![Just(None), Just(Some(MediaKind::Audio)), Just(Some(MediaKind::Video))];
    prop_oneof![
        (any::<bool>(), kind).prop_map(|(a_offers, add)| Step::Round { a_offers, add }),
        any::<bool>().prop_map(|a_offers| Step::DoubleLocal { a_offers }),
        any::<bool>().prop_map(|on_a| Step::Stray { on_a }),
    ]
}

fn round(offerer: &mut Peer, answerer: &mut Peer, double_local: bool) {
    let offer = offerer.observe(|n, t| n.create_offer(t)).unwrap();
    assert!(offerer.observe(|n, _| n.set_local(offer.clone())).unwrap().is_none());
    if double_local {
        let again = offerer.observe(|n, _| n.set_local(offer.clone()));
        assert!(matches!(again, Err(SessionError::InvalidState(_))));
        assert_eq!(offerer.negotiator.state(), SignalingState::HaveLocalOffer);
    }

    assert!(answerer.observe(|n, _| n.set_remote(offer)).unwrap().is_none());
    let answer = answerer.observe(|n, t| n.create_answer(t)).unwrap();
    let answerer_outcome = answerer.observe(|n, _| n.set_local(answer.clone())).unwrap().unwrap();
    let offerer_outcome = offerer.observe(|n, _| n.set_remote(answer)).unwrap().unwrap();

    assert!(offerer_outcome.is_offerer);
    assert!(!answerer_outcome.is_offerer);
    assert_ne!(offerer_outcome.dtls_role, answerer_outcome.dtls_role);
    assert_eq!(offerer_outcome.streams.len(), answerer_outcome.streams.len());
}

fn stray(peer: &mut Peer) {
    let answer = peer.observe(|n, t| n.create_answer(t));
    assert!(matches!(answer, Err(SessionError::InvalidState(_))));

    let mut fake_answer = peer.observe(|n, t| n.create_offer(t)).unwrap();
    fake_answer.sdp_type = SdpType::Answer;
    let result = peer.observe(|n, _| n.set_remote(fake_answer.clone()));
    assert!(matches!(result, Err(SessionError::InvalidState(_))));
    let result = peer.observe(|n, _| n.set_local(fake_answer));
    assert!(matches!(result, Err(SessionError::InvalidState(_))));
    assert_eq!(peer.negotiator.state(), SignalingState::Stable);
}

proptest! {
    #[test]
    fn stable_is_entered_once_per_completed_round(steps in prop::collection::vec(step_strategy(), 1..12)) {
        let mut a = Peer::new(b"peer a");
        let mut b = Peer::new(b"peer b");
        a.negotiator.add_stream(StreamSpec::audio()).unwrap();
        let mut rounds = 0u64;

        for step in steps {
            match step {
                Step::Round { a_offers, add } => {
                    let (offerer, answerer) = if a_offers { (&mut a, &mut b) } else { (&mut b, &mut a) };
                    if let Some(kind) = add {
                        offerer.negotiator.add_stream(StreamSpec::new(kind)).unwrap();
                    }
                    round(offerer, answerer, false);
                    rounds += 1;
                }
                Step::DoubleLocal { a_offers } => {
                    let (offerer, answerer) = if a_offers { (&mut a, &mut b) } else { (&mut b, &mut a) };
                    round(offerer, answerer, true);
                    rounds += 1;
                }
                Step::Stray { on_a } => stray(if on_a { &mut a } else { &mut b }),
            }
        }

        for peer in [&a, &b] {
            prop_assert_eq!(peer.negotiator.state(), SignalingState::Stable);
            prop_assert_eq!(peer.negotiator.completed_rounds(), rounds);
            prop_assert_eq!(peer.stable_entries, rounds);
        }
    }
}

#[test]
fn set_local_twice_fails_with_invalid_state() {
    let mut a = Peer::new(b"peer a");
    a.negotiator.add_stream(StreamSpec::video()).unwrap();
    let offer = a.negotiator.create_offer(&a.transport).unwrap();
    a.negotiator.set_local(offer.clone()).unwrap();

    let err = a.negotiator.set_local(offer).unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(_)));
    assert!(err.is_recoverable());
    assert_eq!(a.negotiator.completed_rounds(), 0);
}

#[test]
fn mids_stay_stable_across_rounds_and_both_sides_agree_on_streams() {
    let mut a = Peer::new(b"peer a");
    let mut b = Peer::new(b"peer b");
    a.negotiator.add_stream(StreamSpec::audio()).unwrap();
    b.negotiator.add_stream(StreamSpec::video()).unwrap();

    round(&mut a, &mut b, false);
    // b's video was never offered by a; b offers it now
    round(&mut b, &mut a, false);

    let offer = a.negotiator.create_offer(&a.transport).unwrap();
    let mids: Vec<&str> = offer.media.iter().map(|m| m.mid.as_str()).collect();
    assert_eq!(mids, vec!["0", "1"]);
    assert_eq!(offer.media[0].kind, MediaKind::Audio);
    assert_eq!(offer.media[1].kind, MediaKind::Video);

    let a_streams = a.negotiator.accepted_streams();
    let b_streams = b.negotiator.accepted_streams();
    assert_eq!(a_streams.len(), 2);
    for (ours, theirs) in a_streams.iter().zip(b_streams) {
        assert_eq!(ours.mid, theirs.mid);
        assert_eq!(ours.codec.name, theirs.codec.name);
        assert_eq!(ours.remote_ssrc, Some(theirs.local_ssrc).filter(|_| theirs.send));
    }
}
