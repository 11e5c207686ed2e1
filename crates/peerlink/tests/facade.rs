use std::time::Duration;

use peerlink::prelude::*;
use serial_test::serial;

#[test]
fn version_information_is_exported() {
    assert!(!peerlink::VERSION.is_empty());
    assert!(peerlink::DESCRIPTION.contains("ICE"));
}

#[test]
fn component_crates_are_reachable_through_the_facade() {
    let config = peerlink::ice_core::IceConfig::loopback();
    assert!(config.validate().is_ok());
    assert_eq!(peerlink::media_core::Codec::opus().clock_rate, 48_000);
    assert!(peerlink::session_core::SessionConfig::loopback().validate().is_ok());
}

// The quick start from the crate docs, driven end to end
#[tokio::test]
#[serial]
async fn quick_start_connects_two_peers() {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        let offerer = PeerSession::create(SessionConfig::loopback()).await?;
        let answerer = PeerSession::create(SessionConfig::loopback()).await?;
        let mut offerer_events = offerer.events().expect("events");
        offerer.add_stream(StreamSpec::audio()).await?;
        answerer.add_stream(StreamSpec::audio()).await?;

        let (ours, theirs) = LoopbackSignaling::pair();
        let offer = offerer.create_offer().await?;
        offerer.set_local_description(offer.clone()).await?;
        ours.send(SignalMessage::description(&offer)).await?;

        let offer = theirs.recv().await.expect("offer").to_description()?.expect("description");
        answerer.set_remote_description(offer).await?;
        let answer = answerer.create_answer().await?;
        answerer.set_local_description(answer.clone()).await?;
        theirs.send(SignalMessage::description(&answer)).await?;

        let answer = ours.recv().await.expect("answer").to_description()?.expect("description");
        offerer.set_remote_description(answer).await?;

        while let Some(event) = offerer_events.recv().await {
            if matches!(event, SessionEvent::Connected) {
                break;
            }
        }
        assert_eq!(offerer.state(), SessionState::Connected);

        offerer.close().await?;
        answerer.close().await?;
        Ok::<_, SessionError>(())
    })
    .await;

    assert!(matches!(result, Ok(Ok(()))), "quick start failed: {:?}", result);
}
