//! Session-level scenarios over the loopback interface

use std::time::Duration;

use ice_core::{GatheringPolicy, IceCandidate, IceConfig};
use media_core::MediaConfig;
use rtp_core::Fingerprint;
use serial_test::serial;
use session_core::prelude::*;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn config() -> SessionConfig {
    SessionConfig::loopback()
        .with_media(MediaConfig::default().with_report_interval(Duration::from_millis(200)))
        .with_close_grace(Duration::from_millis(200))
}

async fn session(config: SessionConfig) -> (PeerSession, UnboundedReceiver<SessionEvent>) {
    infra_common::logging::init_test_logging();
    let session = PeerSession::create(config).await.unwrap();
    let events = session.events().unwrap();
    (session, events)
}

async fn wait_for(
    events: &mut UnboundedReceiver<SessionEvent>,
    mut wanted: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if wanted(&event) {
                return event;
            }
        }
        panic!("event stream ended");
    })
    .await
    .expect("timed out waiting for session event")
}

async fn connected(events: &mut UnboundedReceiver<SessionEvent>) {
    wait_for(events, |e| matches!(e, SessionEvent::Connected)).await;
}

/// One offer/answer round, descriptions travelling over loopback signaling
async fn negotiate(offerer: &PeerSession, answerer: &PeerSession) -> anyhow::Result<()> {
    let (offer_side, answer_side) = LoopbackSignaling::pair();

    let offer = offerer.create_offer().await?;
    offerer.set_local_description(offer.clone()).await?;
    offer_side.send(SignalMessage::description(&offer)).await?;

    let received = answer_side.recv().await.and_then(|m| m.to_description().transpose());
    answerer.set_remote_description(received.expect("offer")?).await?;
    let answer = answerer.create_answer().await?;
    answerer.set_local_description(answer.clone()).await?;
    answer_side.send(SignalMessage::description(&answer)).await?;

    let received = offer_side.recv().await.and_then(|m| m.to_description().transpose());
    offerer.set_remote_description(received.expect("answer")?).await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn two_sessions_connect_and_exchange_media() {
    let (a, mut a_events) = session(config()).await;
    let (b, mut b_events) = session(config()).await;
    let a_ssrc = a.add_stream(StreamSpec::audio()).await.unwrap();
    b.add_stream(StreamSpec::audio()).await.unwrap();

    negotiate(&a, &b).await.unwrap();
    assert_eq!(a.signaling_state().await, session_core::SignalingState::Stable);
    assert_eq!(b.signaling_state().await, session_core::SignalingState::Stable);

    connected(&mut a_events).await;
    connected(&mut b_events).await;
    assert_eq!(a.state(), SessionState::Connected);
    assert_eq!(b.state(), SessionState::Connected);

    a.send_frame(a_ssrc, vec![0x5A; 160], 960).await.unwrap();
    let event = wait_for(&mut b_events, |e| matches!(e, SessionEvent::FrameReceived { .. })).await;
    match event {
        SessionEvent::FrameReceived { ssrc, frame } => {
            assert_eq!(ssrc, a_ssrc);
            assert_eq!(frame.timestamp, 960);
            assert_eq!(&frame.payload[..], &[0x5A; 160][..]);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let stats = wait_for(&mut a_events, |e| matches!(e, SessionEvent::Stats(_))).await;
    if let SessionEvent::Stats(stats) = stats {
        assert_eq!(stats.negotiation_rounds, 1);
        assert!(stats.media.is_some());
    }

    a.close().await.unwrap();
    b.close().await.unwrap();
    wait_for(&mut a_events, |e| matches!(e, SessionEvent::Closed)).await;
    assert_eq!(a.state(), SessionState::Closed);
    assert_eq!(a.active_tasks(), 0);
    assert!(matches!(
        a.send_frame(a_ssrc, vec![1u8], 0).await,
        Err(SessionError::InvalidState(_))
    ));
}

#[tokio::test]
#[serial]
async fn fingerprint_mismatch_fails_with_security_error() {
    let (a, _a_events) = session(config()).await;
    let (b, mut b_events) = session(config()).await;
    a.add_stream(StreamSpec::audio()).await.unwrap();

    let mut offer = a.create_offer().await.unwrap();
    a.set_local_description(offer.clone()).await.unwrap();
    offer.fingerprint = Fingerprint::of_certificate(b"somebody else");
    b.set_remote_description(offer).await.unwrap();
    let answer = b.create_answer().await.unwrap();
    b.set_local_description(answer.clone()).await.unwrap();
    a.set_remote_description(answer).await.unwrap();

    // The answerer is the DTLS client and checks the offerer's certificate
    let event = wait_for(&mut b_events, |e| matches!(e, SessionEvent::Failed(_))).await;
    match event {
        SessionEvent::Failed(error) => {
            assert!(matches!(error, SessionError::Security(_)), "{:?}", error);
            assert!(error.is_terminal());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(b.state(), SessionState::Failed);

    // A failed session keeps no socket and no running tasks
    timeout(WAIT, async {
        while b.active_tasks() > 0 || b.local_address().await.is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("failed session still holds its transport");
    assert_eq!(b.active_tasks(), 0);
    assert!(b.local_address().await.is_none());

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn concurrent_negotiation_is_rejected() {
    let (a, _events) = session(config()).await;
    a.add_stream(StreamSpec::audio()).await.unwrap();

    // An ICE restart waits for the old transport to stop, so the first call
    // is still running when the second one starts
    let (first, second) = tokio::join!(a.create_offer_with(true), a.create_offer_with(true));
    let results = [first, second];
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(SessionError::NegotiationInProgress)))
        .count();
    assert_eq!(rejected, 1);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

    // The guard is released afterwards
    a.create_offer().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn set_local_description_twice_is_invalid() {
    let (a, _events) = session(config()).await;
    a.add_stream(StreamSpec::video()).await.unwrap();

    let offer = a.create_offer().await.unwrap();
    a.set_local_description(offer.clone()).await.unwrap();
    assert_eq!(a.state(), SessionState::Negotiating);

    let err = a.set_local_description(offer).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(_)));
    assert!(matches!(a.create_answer().await, Err(SessionError::InvalidState(_))));

    a.close().await.unwrap();
    assert!(matches!(a.create_offer().await, Err(SessionError::InvalidState(_))));
    assert!(matches!(a.add_stream(StreamSpec::audio()).await, Err(SessionError::InvalidState(_))));
    // Closing again is fine
    a.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn close_during_gathering_releases_tasks_and_socket() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let ice = IceConfig::loopback()
        .with_gathering_policy(GatheringPolicy::All)
        .with_stun_server(silent.local_addr().unwrap().to_string())
        .with_gather_timeout(Duration::from_secs(2), 5)
        .with_close_grace(Duration::from_millis(200));
    let (a, mut events) = session(config().with_ice(ice)).await;

    let port = a.local_address().await.unwrap().port();
    assert!(a.active_tasks() > 0);

    let started = std::time::Instant::now();
    a.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(a.active_tasks(), 0);
    assert!(a.local_address().await.is_none());

    let closed = wait_for(&mut events, |e| matches!(e, SessionEvent::Closed)).await;
    assert!(matches!(closed, SessionEvent::Closed));

    let rebound = UdpSocket::bind(("127.0.0.1", port)).await;
    assert!(rebound.is_ok(), "socket still held: {:?}", rebound.err());
}

#[tokio::test]
#[serial]
async fn ice_restart_recovers_from_failed_connectivity() {
    let ice = IceConfig::loopback().with_connectivity_timeout(Duration::from_millis(300));
    let (a, mut a_events) = session(config().with_ice(ice.clone())).await;
    let (b, mut b_events) = session(config().with_ice(ice)).await;
    a.add_stream(StreamSpec::audio()).await.unwrap();
    b.add_stream(StreamSpec::audio()).await.unwrap();

    // First round points both sides at a socket that never answers
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead_end = vec![IceCandidate::host(silent.local_addr().unwrap(), 1, 65535)];

    let mut offer = a.create_offer().await.unwrap();
    a.set_local_description(offer.clone()).await.unwrap();
    offer.candidates = dead_end.clone();
    b.set_remote_description(offer).await.unwrap();
    let mut answer = b.create_answer().await.unwrap();
    b.set_local_description(answer.clone()).await.unwrap();
    answer.candidates = dead_end;
    a.set_remote_description(answer).await.unwrap();

    let failed = wait_for(&mut a_events, |e| matches!(e, SessionEvent::Failed(_))).await;
    assert!(matches!(failed, SessionEvent::Failed(SessionError::Connectivity(_))));
    wait_for(&mut b_events, |e| matches!(e, SessionEvent::Failed(_))).await;
    assert_eq!(a.state(), SessionState::Failed);

    // Renegotiating with fresh credentials is the way out
    let offer = a.create_offer_with(true).await.unwrap();
    a.set_local_description(offer.clone()).await.unwrap();
    b.set_remote_description(offer).await.unwrap();
    let answer = b.create_answer().await.unwrap();
    b.set_local_description(answer.clone()).await.unwrap();
    a.set_remote_description(answer).await.unwrap();

    connected(&mut a_events).await;
    connected(&mut b_events).await;
    assert_eq!(a.stats().await.negotiation_rounds, 2);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn dropping_an_open_session_releases_its_socket() {
    let (a, _events) = session(config()).await;
    let address = a.local_address().await.expect("bound after create");
    drop(a);

    // The agent closes on a spawned task, after which the port is free
    timeout(WAIT, async {
        while UdpSocket::bind(address).await.is_err() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("socket still bound after drop");
}
