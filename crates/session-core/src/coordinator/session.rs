//! The peer session controller
//!
//! A [`PeerSession`] owns one negotiator, one ICE agent per transport
//! generation and, once connected, one media pipeline. Negotiation calls are
//! serialized by a non-blocking guard: a call made while another one runs
//! fails with [`SessionError::NegotiationInProgress`] instead of queueing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use ice_core::{IceAgent, IceAgentState, IceCandidate, IceRole};
use infra_common::TaskManager;
use media_core::{MediaFrame, MediaPipeline, MediaStats, StreamConfig};
use parking_lot::{Mutex, RwLock};
use rtp_core::{DtlsIdentity, DtlsSession, Fingerprint, RtpSsrc, RtpTimestamp};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::transport::IceDatagram;
use crate::config::SessionConfig;
use crate::errors::{Result, SessionError};
use crate::events::{SessionEvent, SessionStats};
use crate::sdp::{LocalTransport, NegotiationOutcome, Negotiator, SdpType, SessionDescription, SignalingState};
use crate::types::{SessionId, SessionState, StreamSpec};

/// One ICE agent and everything running on top of it. An ICE restart
/// replaces the whole generation.
pub(super) struct Generation {
    pub(super) agent: IceAgent,
    pub(super) tasks: TaskManager,
    pub(super) ice_state: watch::Receiver<IceAgentState>,
    connecting: AtomicBool,
    pub(super) media: Mutex<Option<MediaLink>>,
}

/// Secured media path of a connected generation
pub(super) struct MediaLink {
    pub(super) pipeline: Arc<MediaPipeline>,
    pub(super) dtls: Arc<DtlsSession>,
    pub(super) transport: IceDatagram,
}

pub(super) struct SessionInner {
    pub(super) id: SessionId,
    pub(super) config: SessionConfig,
    pub(super) identity: DtlsIdentity,
    pub(super) span: Span,
    negotiator: tokio::sync::Mutex<Negotiator>,
    state: RwLock<SessionState>,
    generation: RwLock<Option<Arc<Generation>>>,
    /// Streams of the last completed round
    pub(super) streams: Mutex<Vec<StreamConfig>>,
    rounds: AtomicU64,
    tasks: TaskManager,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// A peer-to-peer media session
pub struct PeerSession {
    inner: Arc<SessionInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl PeerSession {
    /// Create a session and start gathering local candidates
    pub async fn create(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let id = SessionId::new();
        let span = info_span!("session", id = %id);
        let identity = DtlsIdentity::generate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SessionInner {
            id,
            negotiator: tokio::sync::Mutex::new(Negotiator::new(config.codecs.clone())),
            tasks: TaskManager::new(format!("session-{}", id)),
            config,
            identity,
            span: span.clone(),
            state: RwLock::new(SessionState::New),
            generation: RwLock::new(None),
            streams: Mutex::new(Vec::new()),
            rounds: AtomicU64::new(0),
            events: events_tx,
        });

        inner.start_generation().instrument(span.clone()).await?;
        info!(parent: &span, fingerprint = %inner.identity.fingerprint(), "Session created");

        Ok(Self {
            inner,
            events: Mutex::new(Some(events_rx)),
        })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// The event stream. Only the first call gets it.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.lock().take()
    }

    /// Fingerprint of the certificate this session presents
    pub fn local_fingerprint(&self) -> Fingerprint {
        self.inner.identity.fingerprint()
    }

    pub async fn signaling_state(&self) -> SignalingState {
        self.inner.negotiator.lock().await.state()
    }

    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.inner.negotiator.lock().await.local_description().cloned()
    }

    pub async fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.negotiator.lock().await.remote_description().cloned()
    }

    /// Add a local stream. It is offered or answered in the next round.
    pub async fn add_stream(&self, spec: StreamSpec) -> Result<RtpSsrc> {
        self.inner.negotiator.lock().await.add_stream(spec)
    }

    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.create_offer_with(false).await
    }

    /// Create an offer, optionally with fresh ICE credentials and a new
    /// agent. A restart is the only way out of [`SessionState::Failed`].
    pub async fn create_offer_with(&self, ice_restart: bool) -> Result<SessionDescription> {
        let inner = &self.inner;
        async {
            let mut negotiator = inner.begin_negotiation()?;
            if negotiator.state() != SignalingState::Stable {
                return Err(SessionError::invalid_state(format!(
                    "cannot create an offer in state {}",
                    negotiator.state()
                )));
            }
            if ice_restart {
                inner.restart_ice().await?;
            }
            let transport = inner.local_transport().await?;
            let offer = negotiator.create_offer(&transport)?;
            debug!(version = offer.version, media = offer.media.len(), ice_restart, "Created offer");
            Ok(offer)
        }
        .instrument(inner.span.clone())
        .await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let inner = &self.inner;
        async {
            let mut negotiator = inner.begin_negotiation()?;
            let transport = inner.local_transport().await?;
            let answer = negotiator.create_answer(&transport)?;
            debug!(version = answer.version, media = answer.media.len(), "Created answer");
            Ok(answer)
        }
        .instrument(inner.span.clone())
        .await
    }

    pub async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let inner = &self.inner;
        async {
            let mut negotiator = inner.begin_negotiation()?;
            let outcome = negotiator.set_local(description)?;
            inner.after_description(outcome).await
        }
        .instrument(inner.span.clone())
        .await
    }

    pub async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let inner = &self.inner;
        async {
            let mut negotiator = inner.begin_negotiation()?;
            if description.sdp_type == SdpType::Offer && negotiator.state() == SignalingState::Stable {
                if negotiator.restarts_ice(&description) {
                    info!("Remote offer restarts ICE");
                    inner.restart_ice().await?;
                }
            }
            let outcome = negotiator.set_remote(description)?;
            inner.after_description(outcome).await
        }
        .instrument(inner.span.clone())
        .await
    }

    /// Add a trickled remote candidate
    pub async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.inner.ensure_open()?;
        let generation = self.inner.generation()?;
        generation.agent.add_remote_candidate(candidate).await?;
        Ok(())
    }

    /// Send one media frame on a negotiated stream
    pub async fn send_frame(&self, ssrc: RtpSsrc, payload: impl Into<Bytes>, timestamp: RtpTimestamp) -> Result<usize> {
        let pipeline = self
            .inner
            .pipeline()
            .ok_or_else(|| SessionError::invalid_state(format!("session is {}", self.state())))?;
        Ok(pipeline.send_frame(ssrc, MediaFrame::new(timestamp, payload)).await?)
    }

    pub async fn stats(&self) -> SessionStats {
        let media = self.inner.pipeline().map(|p| p.stats());
        self.inner.stats(media).await
    }

    /// Address of the current ICE socket, `None` once closed
    pub async fn local_address(&self) -> Option<SocketAddr> {
        let generation = self.inner.current_generation()?;
        generation.agent.local_address().await
    }

    /// Tasks still running for this session, ICE agent included
    pub fn active_tasks(&self) -> usize {
        let generation = self
            .inner
            .current_generation()
            .map_or(0, |g| g.tasks.active_task_count() + g.agent.active_tasks());
        self.inner.tasks.active_task_count() + generation
    }

    /// Close the session: cancel every task, wait up to the grace period and
    /// release the socket. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        async {
            {
                let mut state = inner.state.write();
                if *state == SessionState::Closed {
                    return Ok(());
                }
                *state = SessionState::Closed;
            }
            inner.emit(SessionEvent::StateChanged(SessionState::Closed));
            inner.negotiator.lock().await.close();

            let generation = inner.generation.write().take();
            if let Some(generation) = generation {
                let link = generation.media.lock().take();
                if let Some(link) = link {
                    // Best effort, the peer also notices through consent freshness
                    if let Err(e) = rtp_core::DatagramTransport::send(&link.transport, &link.dtls.close_notify()).await {
                        debug!("Failed to send close_notify: {}", e);
                    }
                }
                inner.retire(generation).await;
            }

            if !inner.tasks.shutdown(inner.config.close_grace()).await {
                warn!("Session tasks aborted after the grace period");
            }
            info!("Session closed");
            inner.emit(SessionEvent::Closed);
            Ok(())
        }
        .instrument(inner.span.clone())
        .await
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if self.inner.state() == SessionState::Closed {
            return;
        }
        self.inner.tasks.cancel_all();
        // The agent owns a socket and tasks of its own; close it if a
        // runtime is still around
        if let (Some(generation), Ok(handle)) = (
            self.inner.current_generation(),
            tokio::runtime::Handle::try_current(),
        ) {
            let agent = generation.agent.clone();
            handle.spawn(async move {
                if let Err(e) = agent.close().await {
                    debug!("Closing ICE agent on drop: {}", e);
                }
            });
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl SessionInner {
    pub(super) fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub(super) fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Session event dropped - receiver gone");
        }
    }

    /// Move to `next` unless the session is closed. Returns whether the
    /// session is still open.
    pub(super) fn set_state(&self, next: SessionState) -> bool {
        {
            let mut state = self.state.write();
            if *state == SessionState::Closed {
                return false;
            }
            if *state == next {
                return true;
            }
            debug!("Session state {} -> {}", *state, next);
            *state = next;
        }
        self.emit(SessionEvent::StateChanged(next));
        true
    }

    /// Move from `from` to `to`; does nothing in any other state
    pub(super) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        {
            let mut state = self.state.write();
            if *state != from {
                return false;
            }
            debug!("Session state {} -> {}", from, to);
            *state = to;
        }
        self.emit(SessionEvent::StateChanged(to));
        true
    }

    /// Enter `Failed`, stop the current generation and close its agent.
    /// Only the first failure is reported.
    pub(super) fn fail(&self, error: SessionError) {
        {
            let mut state = self.state.write();
            if matches!(*state, SessionState::Closed | SessionState::Failed) {
                debug!("Ignoring failure in state {}: {}", *state, error);
                return;
            }
            *state = SessionState::Failed;
        }
        warn!(%error, "Session failed");
        self.emit(SessionEvent::StateChanged(SessionState::Failed));
        self.emit(SessionEvent::Failed(error));

        if let Some(generation) = self.current_generation() {
            generation.media.lock().take();
            generation.tasks.cancel_all();
            // Release the socket; a restart builds a fresh generation
            let agent = generation.agent.clone();
            self.tasks.spawn("ice-close", async move {
                if let Err(e) = agent.close().await {
                    debug!("Closing ICE agent: {}", e);
                }
            });
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::invalid_state("session is closed"));
        }
        Ok(())
    }

    fn begin_negotiation(&self) -> Result<tokio::sync::MutexGuard<'_, Negotiator>> {
        self.ensure_open()?;
        self.negotiator
            .try_lock()
            .map_err(|_| SessionError::NegotiationInProgress)
    }

    pub(super) fn current_generation(&self) -> Option<Arc<Generation>> {
        self.generation.read().clone()
    }

    fn generation(&self) -> Result<Arc<Generation>> {
        self.current_generation()
            .ok_or_else(|| SessionError::invalid_state("no ICE transport"))
    }

    fn pipeline(&self) -> Option<Arc<MediaPipeline>> {
        let generation = self.current_generation()?;
        let pipeline = generation.media.lock().as_ref().map(|link| link.pipeline.clone());
        pipeline
    }

    async fn local_transport(&self) -> Result<LocalTransport> {
        let generation = self.generation()?;
        Ok(LocalTransport {
            credentials: generation.agent.local_credentials().clone(),
            fingerprint: self.identity.fingerprint(),
            candidates: generation.agent.local_candidates().await,
            end_of_candidates: generation.agent.is_gathering_complete(),
        })
    }

    pub(super) async fn stats(&self, media: Option<MediaStats>) -> SessionStats {
        let ice = match self.current_generation() {
            Some(generation) => generation.agent.stats().await,
            None => Default::default(),
        };
        SessionStats {
            session_id: self.id,
            state: self.state(),
            negotiation_rounds: self.rounds.load(Ordering::Relaxed),
            ice,
            media,
        }
    }

    /// Create an ICE agent, forward its events and gather host candidates
    async fn start_generation(self: &Arc<Self>) -> Result<()> {
        let (agent, agent_events) = IceAgent::new(self.config.ice.clone(), IceRole::Controlling)?;
        let tasks = TaskManager::child_of(
            format!("session-{}-ice-{}", self.id, agent.local_credentials().ufrag),
            &self.tasks.token(),
        );
        let (state_tx, state_rx) = watch::channel(IceAgentState::New);

        let forwarder = self.clone();
        tasks.spawn(
            "ice-events",
            async move { forwarder.forward_ice_events(agent_events, state_tx).await }.instrument(self.span.clone()),
        );

        if let Err(e) = agent.gather_candidates().await {
            tasks.cancel_all();
            if let Err(close_error) = agent.close().await {
                debug!("Closing ICE agent after failed gathering: {}", close_error);
            }
            return Err(e.into());
        }

        *self.generation.write() = Some(Arc::new(Generation {
            agent,
            tasks,
            ice_state: state_rx,
            connecting: AtomicBool::new(false),
            media: Mutex::new(None),
        }));
        Ok(())
    }

    /// Stop a generation's tasks and close its agent
    async fn retire(&self, generation: Arc<Generation>) {
        generation.media.lock().take();
        if !generation.tasks.shutdown(self.config.close_grace()).await {
            warn!("Transport tasks aborted after the grace period");
        }
        if let Err(e) = generation.agent.close().await {
            debug!("Closing ICE agent: {}", e);
        }
    }

    async fn restart_ice(self: &Arc<Self>) -> Result<()> {
        let old = self.generation.write().take();
        if let Some(old) = old {
            self.retire(old).await;
        }
        self.start_generation().await?;
        self.set_state(SessionState::Negotiating);
        info!("ICE restarted with fresh credentials");
        Ok(())
    }

    async fn after_description(self: &Arc<Self>, outcome: Option<NegotiationOutcome>) -> Result<()> {
        match outcome {
            None => {
                self.transition(SessionState::New, SessionState::Negotiating);
                Ok(())
            }
            Some(outcome) => self.apply_outcome(outcome).await,
        }
    }

    /// Act on a completed round: start connecting on a fresh generation,
    /// otherwise reconfigure the running streams
    async fn apply_outcome(self: &Arc<Self>, outcome: NegotiationOutcome) -> Result<()> {
        self.rounds.store(outcome.round, Ordering::Relaxed);
        *self.streams.lock() = outcome.streams.clone();
        let generation = self.generation()?;

        if !generation.connecting.swap(true, Ordering::SeqCst) {
            let agent = &generation.agent;
            let role = if outcome.is_offerer {
                IceRole::Controlling
            } else {
                IceRole::Controlled
            };
            agent.set_role(role).await;
            agent.set_remote_credentials(outcome.remote_credentials.clone()).await;
            for candidate in &outcome.remote_candidates {
                if let Err(e) = agent.add_remote_candidate(candidate.clone()).await {
                    debug!(%candidate, "Skipping remote candidate: {}", e);
                }
            }
            self.spawn_connect(generation.clone(), outcome.dtls_role, outcome.remote_fingerprint);
            return Ok(());
        }

        let pipeline = generation.media.lock().as_ref().map(|link| link.pipeline.clone());
        if let Some(pipeline) = pipeline {
            let removed = pipeline.update_streams(outcome.streams)?;
            if !removed.is_empty() {
                info!(?removed, "Renegotiation removed streams");
            }
        }
        Ok(())
    }
}
