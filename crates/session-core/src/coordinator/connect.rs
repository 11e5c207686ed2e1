//! Connection establishment and the per-generation background tasks
//!
//! ```text
//! checks -> ICE connected -> DTLS handshake -> media pipeline -> receive loop
//! ```
//!
//! After the handshake the receive loop owns the ICE byte stream and
//! demultiplexes it by first byte (RFC 7983): DTLS records go to the
//! finished handshake, RTP and RTCP to the pipeline.

use std::sync::Arc;

use bytes::Bytes;
use ice_core::{IceAgentEvent, IceAgentState};
use media_core::{MediaEvent, MediaPipeline};
use rtp_core::{DatagramTransport, DtlsRole, DtlsSession, Fingerprint};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, Instrument};

use super::session::{Generation, MediaLink, SessionInner};
use super::transport::IceDatagram;
use crate::errors::{Result, SessionError};
use crate::events::SessionEvent;
use crate::types::SessionState;

/// TLS alert code of close_notify
const CLOSE_NOTIFY: u8 = 0;

impl SessionInner {
    pub(super) fn spawn_connect(self: &Arc<Self>, generation: Arc<Generation>, role: DtlsRole, remote_fingerprint: Fingerprint) {
        let inner = self.clone();
        let task_generation = generation.clone();
        generation.tasks.spawn(
            "connect",
            async move {
                if let Err(e) = inner.connect(&task_generation, role, remote_fingerprint).await {
                    inner.fail(e);
                }
            }
            .instrument(self.span.clone()),
        );
    }

    async fn connect(self: &Arc<Self>, generation: &Generation, role: DtlsRole, remote_fingerprint: Fingerprint) -> Result<()> {
        if !self.set_state(SessionState::Connecting) {
            return Ok(());
        }
        generation.agent.start_checks().await?;

        let mut ice_state = generation.ice_state.clone();
        let reached = ice_state
            .wait_for(|state| {
                matches!(
                    state,
                    IceAgentState::Connected | IceAgentState::Failed | IceAgentState::Closed
                )
            })
            .await
            .map(|state| *state);
        match reached {
            Ok(IceAgentState::Connected) => {}
            Ok(IceAgentState::Failed) => {
                return Err(SessionError::Connectivity("no candidate pair succeeded".into()));
            }
            _ => return Ok(()),
        }

        let transport = IceDatagram::new(generation.agent.transport());
        debug!(?role, "Starting DTLS handshake");
        let dtls = rtp_core::dtls::handshake(&transport, &self.identity, role, &remote_fingerprint, &self.config.dtls).await?;
        info!(profile = %dtls.srtp_profile(), "Media path secured");

        let streams = self.streams.lock().clone();
        let (pipeline, media_events) = MediaPipeline::new(
            self.config.media.clone(),
            dtls.srtp_session(),
            Arc::new(transport.clone()),
            streams,
        )?;
        let dtls = Arc::new(dtls);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.media.inbound_queue);

        let runner = pipeline.clone();
        let token = generation.tasks.token();
        generation.tasks.spawn(
            "media-pipeline",
            async move { runner.run(inbound_rx, token).await }.instrument(self.span.clone()),
        );
        let forwarder = self.clone();
        generation.tasks.spawn(
            "media-events",
            async move { forwarder.forward_media_events(media_events).await }.instrument(self.span.clone()),
        );

        *generation.media.lock() = Some(MediaLink {
            pipeline,
            dtls: dtls.clone(),
            transport: transport.clone(),
        });
        if !self.set_state(SessionState::Connected) {
            return Ok(());
        }
        info!("Session connected");
        self.emit(SessionEvent::Connected);

        self.receive_loop(&transport, &dtls, inbound_tx).await
    }

    async fn receive_loop(&self, transport: &IceDatagram, dtls: &DtlsSession, inbound: mpsc::Sender<Bytes>) -> Result<()> {
        loop {
            let datagram = match transport.recv().await {
                Ok(datagram) => datagram,
                Err(e) => {
                    debug!("Receive loop ended: {}", e);
                    return Ok(());
                }
            };

            match datagram.first().copied() {
                Some(20..=63) => match dtls.handle_late_datagram(&datagram) {
                    Ok(Some(flight)) => transport.send(&flight).await?,
                    Ok(None) => {}
                    Err(rtp_core::Error::AlertReceived(CLOSE_NOTIFY)) => {
                        info!("Peer closed the DTLS association");
                        if self.transition(SessionState::Connected, SessionState::Disconnected) {
                            self.emit(SessionEvent::Disconnected);
                        }
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                },
                Some(128..=191) => match inbound.try_send(datagram) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => trace!("Inbound media queue full, dropping datagram"),
                    Err(TrySendError::Closed(_)) => return Ok(()),
                },
                _ => trace!(len = datagram.len(), "Ignoring datagram outside the demultiplexing ranges"),
            }
        }
    }

    pub(super) async fn forward_ice_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<IceAgentEvent>,
        state: watch::Sender<IceAgentState>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                IceAgentEvent::NewCandidate(candidate) => {
                    debug!(%candidate, "Local candidate");
                    self.emit(SessionEvent::LocalCandidate(candidate));
                }
                IceAgentEvent::GatheringComplete => self.emit(SessionEvent::GatheringComplete),
                IceAgentEvent::SelectedPair { local, remote } => {
                    info!(pair = %format!("{} -> {}", local.socket_addr(), remote.socket_addr()), "Selected candidate pair");
                }
                IceAgentEvent::StateChange(ice_state) => {
                    state.send_replace(ice_state);
                    match ice_state {
                        IceAgentState::Disconnected => {
                            if self.transition(SessionState::Connected, SessionState::Disconnected) {
                                self.emit(SessionEvent::Disconnected);
                            }
                        }
                        IceAgentState::Connected => {
                            if self.transition(SessionState::Disconnected, SessionState::Connected) {
                                self.emit(SessionEvent::Connected);
                            }
                        }
                        IceAgentState::Failed => {
                            self.fail(SessionError::Connectivity("ICE connectivity failed".into()));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn forward_media_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MediaEvent>) {
        while let Some(event) = events.recv().await {
            let event = match event {
                MediaEvent::FrameReceived { ssrc, frame } => SessionEvent::FrameReceived { ssrc, frame },
                MediaEvent::LatePacketDiscarded {
                    ssrc,
                    sequence_number,
                    total,
                } => SessionEvent::LatePacketDiscarded {
                    ssrc,
                    sequence_number,
                    total,
                },
                MediaEvent::TargetBitrateChanged { bps } => SessionEvent::TargetBitrateChanged { bps },
                MediaEvent::StatsUpdated(media) => SessionEvent::Stats(self.stats(Some(media)).await),
            };
            self.emit(event);
        }
    }
}
