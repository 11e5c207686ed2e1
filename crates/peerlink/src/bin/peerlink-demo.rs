//! Two in-process peers negotiating over loopback signaling and streaming
//! synthetic frames to each other.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use peerlink::prelude::*;
use peerlink::rtp_core::RtpSsrc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "peerlink-demo", version, about = "Stream synthetic media between two local peers")]
struct Args {
    /// How long to stream, in seconds
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    /// Frame interval in milliseconds
    #[arg(long, default_value_t = 20)]
    frame_ms: u64,

    /// Add a video stream next to the audio one
    #[arg(long)]
    video: bool,

    /// TOML configuration file; loopback defaults when absent
    #[arg(short, long, env = "PEERLINK_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info", env = "PEERLINK_LOG")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

/// What the peer's event task reports back to `main`
#[derive(Debug)]
enum Milestone {
    Connected(&'static str),
    Failed(&'static str, SessionError),
}

struct Peer {
    name: &'static str,
    session: Arc<PeerSession>,
    signaling: Arc<LoopbackSignaling>,
    frames_received: Arc<AtomicU64>,
}

impl Peer {
    async fn create(name: &'static str, config: SessionConfig, signaling: LoopbackSignaling) -> anyhow::Result<Self> {
        let session = PeerSession::create(config)
            .await
            .with_context(|| format!("creating peer {}", name))?;
        info!(peer = name, id = %session.id(), fingerprint = %session.local_fingerprint(), "Peer created");
        Ok(Self {
            name,
            session: Arc::new(session),
            signaling: Arc::new(signaling),
            frames_received: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Print events and trickle local candidates to the other peer
    fn spawn_event_loop(&self, milestones: mpsc::UnboundedSender<Milestone>) -> anyhow::Result<JoinHandle<()>> {
        let Some(mut events) = self.session.events() else {
            bail!("event stream of {} already taken", self.name);
        };
        let name = self.name;
        let signaling = self.signaling.clone();
        let frames = self.frames_received.clone();

        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::LocalCandidate(candidate) => {
                        if let Err(e) = signaling.send(SignalMessage::candidate(&candidate)).await {
                            warn!(peer = name, "Failed to trickle candidate: {}", e);
                        }
                    }
                    SessionEvent::GatheringComplete => {
                        let _ = signaling.send(SignalMessage::EndOfCandidates).await;
                    }
                    SessionEvent::StateChanged(state) => println!("[{}] state -> {}", name, state),
                    SessionEvent::Connected => {
                        let _ = milestones.send(Milestone::Connected(name));
                    }
                    SessionEvent::Failed(error) => {
                        let _ = milestones.send(Milestone::Failed(name, error));
                    }
                    SessionEvent::FrameReceived { ssrc, frame } => {
                        let total = frames.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(peer = name, ssrc, timestamp = frame.timestamp, len = frame.payload.len(), total, "Frame");
                    }
                    SessionEvent::LatePacketDiscarded { ssrc, sequence_number, .. } => {
                        println!("[{}] late packet ssrc={} seq={}", name, ssrc, sequence_number);
                    }
                    SessionEvent::TargetBitrateChanged { bps } => {
                        println!("[{}] target bitrate {} kbps", name, bps / 1000);
                    }
                    SessionEvent::Stats(stats) => {
                        if let Some(media) = stats.media {
                            match serde_json::to_string(&media) {
                                Ok(json) => println!("[{}] stats {}", name, json),
                                Err(e) => warn!("Failed to encode stats: {}", e),
                            }
                        }
                    }
                    SessionEvent::Disconnected | SessionEvent::Closed => {
                        println!("[{}] {}", name, event.name());
                    }
                }
            }
        }))
    }

    /// Apply whatever the other peer sends: offers are answered in place
    fn spawn_signaling_loop(&self) -> JoinHandle<()> {
        let name = self.name;
        let session = self.session.clone();
        let signaling = self.signaling.clone();

        tokio::spawn(async move {
            while let Some(message) = signaling.recv().await {
                if let Err(e) = apply_signal(&session, signaling.as_ref(), message).await {
                    warn!(peer = name, "Signaling message rejected: {}", e);
                }
            }
        })
    }
}

async fn apply_signal(session: &PeerSession, signaling: &LoopbackSignaling, message: SignalMessage) -> Result<()> {
    if let Some(description) = message.to_description()? {
        let is_offer = description.sdp_type == SdpType::Offer;
        session.set_remote_description(description).await?;
        if is_offer {
            let answer = session.create_answer().await?;
            session.set_local_description(answer.clone()).await?;
            signaling.send(SignalMessage::description(&answer)).await?;
        }
    } else if let Some(candidate) = message.to_candidate()? {
        session.add_candidate(candidate).await?;
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let config = match &args.config {
        Some(path) => SessionConfig::load(Some(path.as_path())).with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::loopback(),
    };
    Ok(config)
}

async fn stream(peer: &Peer, streams: &[(RtpSsrc, MediaKind)], args: &Args) -> anyhow::Result<u64> {
    let mut ticker = tokio::time::interval(Duration::from_millis(args.frame_ms.max(1)));
    let frames = args.seconds * 1000 / args.frame_ms.max(1);
    let mut sent = 0;

    for n in 0..frames {
        ticker.tick().await;
        for (ssrc, kind) in streams {
            let (clock_rate, size) = match kind {
                MediaKind::Audio => (48_000, 160),
                MediaKind::Video => (90_000, 4_000),
            };
            let timestamp = (n * clock_rate * args.frame_ms.max(1) / 1000) as u32;
            let payload = vec![(n % 251) as u8; size];
            peer.session
                .send_frame(*ssrc, payload, timestamp)
                .await
                .with_context(|| format!("{} sending on ssrc {}", peer.name, ssrc))?;
            sent += 1;
        }
    }
    Ok(sent)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut logging = LoggingConfig::default();
    logging.level = args.log_level.clone();
    logging.json = args.json;
    logging.app_name = "peerlink-demo".into();
    setup_logging(&logging)?;
    info!("{} {}", peerlink::DESCRIPTION, peerlink::VERSION);

    let config = load_config(&args)?;
    let (a_end, b_end) = LoopbackSignaling::pair();
    let alice = Peer::create("alice", config.clone(), a_end).await?;
    let bob = Peer::create("bob", config, b_end).await?;

    let mut kinds = vec![MediaKind::Audio];
    if args.video {
        kinds.push(MediaKind::Video);
    }
    let mut outgoing = Vec::new();
    for kind in &kinds {
        outgoing.push((alice.session.add_stream(StreamSpec::new(*kind)).await?, *kind));
        bob.session.add_stream(StreamSpec::new(*kind)).await?;
    }

    let (milestones_tx, mut milestones) = mpsc::unbounded_channel();
    let tasks = vec![
        alice.spawn_event_loop(milestones_tx.clone())?,
        bob.spawn_event_loop(milestones_tx)?,
        alice.spawn_signaling_loop(),
        bob.spawn_signaling_loop(),
    ];

    let offer = alice.session.create_offer().await?;
    alice.session.set_local_description(offer.clone()).await?;
    alice.signaling.send(SignalMessage::description(&offer)).await?;

    let mut connected = 0;
    while connected < 2 {
        match tokio::time::timeout(Duration::from_secs(10), milestones.recv()).await {
            Ok(Some(Milestone::Connected(name))) => {
                println!("[{}] connected", name);
                connected += 1;
            }
            Ok(Some(Milestone::Failed(name, error))) => bail!("{} failed: {}", name, error),
            Ok(None) => bail!("event loops ended before connecting"),
            Err(_) => bail!("peers did not connect within 10s"),
        }
    }

    let sent = stream(&alice, &outgoing, &args).await?;
    // Let the last frames drain through the jitter buffer
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = alice.session.stats().await;
    println!(
        "sent {} frames, bob received {}, rounds {}, alice ICE checks sent {}",
        sent,
        bob.frames_received.load(Ordering::Relaxed),
        stats.negotiation_rounds,
        stats.ice.checks_sent,
    );

    alice.session.close().await?;
    bob.session.close().await?;
    for task in tasks {
        task.abort();
    }
    Ok(())
}
