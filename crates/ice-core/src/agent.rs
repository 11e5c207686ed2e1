use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use infra_common::TaskManager;
use rand::distributions::Alphanumeric;
use rand::{random, Rng};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::candidate::{CandidateType, IceCandidate, TransportType};
use crate::checklist::{CandidatePair, CandidatePairState, Checklist};
use crate::config::{GatheringPolicy, IceComponent, IceConfig, IceRole, IceServerConfig};
use crate::error::{Error, Result};
use crate::gather;
use crate::stun::{self, StunAttribute, StunClass, StunMessage, METHOD_BINDING};
use crate::transaction::{transact, RetransmitPolicy, StunReply, TransactionTable};
use crate::transport::IceTransport;

/// Largest datagram the receive loop accepts
const RECV_BUFFER_SIZE: usize = 2048;

/// Capacity of the channel feeding non-STUN datagrams to the transport
const DATA_CHANNEL_CAPACITY: usize = 1024;

/// ICE agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceAgentState {
    /// Initial state
    New,

    /// Gathering candidates
    Gathering,

    /// All candidates gathered, checks not started
    Complete,

    /// Checking connectivity
    Checking,

    /// A pair is selected and usable
    Connected,

    /// Consent lost on the selected pair
    Disconnected,

    /// No pair could be validated
    Failed,

    /// Agent closed
    Closed,
}

impl std::fmt::Display for IceAgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Gathering => write!(f, "gathering"),
            Self::Complete => write!(f, "complete"),
            Self::Checking => write!(f, "checking"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// ICE agent events
#[derive(Debug, Clone)]
pub enum IceAgentEvent {
    /// State change
    StateChange(IceAgentState),

    /// New local candidate found
    NewCandidate(IceCandidate),

    /// Every configured server answered or gave up
    GatheringComplete,

    /// Selected pair changed
    SelectedPair {
        local: IceCandidate,
        remote: IceCandidate,
    },
}

/// Username fragment and password of one side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn new(ufrag: impl Into<String>, pwd: impl Into<String>) -> Self {
        Self {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }

    /// Random credentials (ufrag 8 chars, password 24 chars)
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut token = |len: usize| -> String {
            (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect()
        };
        let ufrag = token(8);
        let pwd = token(24);
        Self { ufrag, pwd }
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceAgentStats {
    pub local_candidates: usize,
    pub remote_candidates: usize,
    pub checklist_pairs: usize,
    pub checks_sent: u64,
    pub checks_succeeded: u64,
    pub server_failures: u64,
}

/// ICE agent for NAT traversal.
///
/// The agent owns the UDP socket. Cloning yields another handle to the same
/// agent.
#[derive(Clone)]
pub struct IceAgent {
    /// ICE configuration
    config: Arc<IceConfig>,

    /// Agent role (controlling or controlled)
    role: Arc<RwLock<IceRole>>,

    /// Current state
    state: Arc<RwLock<IceAgentState>>,

    local_credentials: IceCredentials,
    remote_credentials: Arc<RwLock<Option<IceCredentials>>>,

    /// Local candidates
    local_candidates: Arc<RwLock<Vec<IceCandidate>>>,

    /// Remote candidates
    remote_candidates: Arc<RwLock<Vec<IceCandidate>>>,

    /// Candidate pairs for connectivity checks
    checklist: Arc<RwLock<Checklist>>,

    /// Selected pair
    selected_pair: Arc<RwLock<Option<CandidatePair>>>,

    /// The agent's socket, present between gathering and close
    socket: Arc<RwLock<Option<Arc<UdpSocket>>>>,

    transactions: TransactionTable,

    /// ICE tiebreaker (for role conflicts)
    tiebreaker: u64,

    /// Every task spawned by the agent
    tasks: Arc<TaskManager>,

    /// Event sender
    event_tx: mpsc::UnboundedSender<IceAgentEvent>,

    /// Inbound DTLS/RTP/RTCP datagrams
    data_tx: mpsc::Sender<Bytes>,
    data_rx: Arc<Mutex<mpsc::Receiver<Bytes>>>,

    last_inbound: Arc<parking_lot::Mutex<Instant>>,
    checks_started: Arc<AtomicBool>,
    nominating: Arc<AtomicBool>,
    gathering_complete: Arc<AtomicBool>,
    checks_sent: Arc<AtomicU64>,
    checks_succeeded: Arc<AtomicU64>,
    server_failures: Arc<AtomicU64>,
}

impl IceAgent {
    /// Create a new ICE agent
    pub fn new(config: IceConfig, initial_role: IceRole) -> Result<(Self, mpsc::UnboundedReceiver<IceAgentEvent>)> {
        config.validate()?;

        let local_credentials = IceCredentials::generate();
        debug!(
            "Creating ICE agent ufrag={} with role {:?}",
            local_credentials.ufrag, initial_role
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);

        let agent = Self {
            checklist: Arc::new(RwLock::new(Checklist::new(config.max_checklist_pairs))),
            tasks: Arc::new(TaskManager::new(format!("ice-agent-{}", local_credentials.ufrag))),
            config: Arc::new(config),
            role: Arc::new(RwLock::new(initial_role)),
            state: Arc::new(RwLock::new(IceAgentState::New)),
            local_credentials,
            remote_credentials: Arc::new(RwLock::new(None)),
            local_candidates: Arc::new(RwLock::new(Vec::new())),
            remote_candidates: Arc::new(RwLock::new(Vec::new())),
            selected_pair: Arc::new(RwLock::new(None)),
            socket: Arc::new(RwLock::new(None)),
            transactions: TransactionTable::default(),
            tiebreaker: random::<u64>(),
            event_tx,
            data_tx,
            data_rx: Arc::new(Mutex::new(data_rx)),
            last_inbound: Arc::new(parking_lot::Mutex::new(Instant::now())),
            checks_started: Arc::new(AtomicBool::new(false)),
            nominating: Arc::new(AtomicBool::new(false)),
            gathering_complete: Arc::new(AtomicBool::new(false)),
            checks_sent: Arc::new(AtomicU64::new(0)),
            checks_succeeded: Arc::new(AtomicU64::new(0)),
            server_failures: Arc::new(AtomicU64::new(0)),
        };

        Ok((agent, event_rx))
    }

    pub fn config(&self) -> &IceConfig {
        &self.config
    }

    pub fn local_credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    /// Get the current ICE role
    pub async fn role(&self) -> IceRole {
        *self.role.read().await
    }

    /// Set the ICE role
    pub async fn set_role(&self, role: IceRole) {
        let mut role_guard = self.role.write().await;
        if *role_guard != role {
            debug!("Changing ICE role from {:?} to {:?}", *role_guard, role);
            *role_guard = role;
            self.checklist.write().await.set_role(role);
        }
    }

    /// Get current state
    pub async fn state(&self) -> IceAgentState {
        *self.state.read().await
    }

    /// Set the ICE agent state. Closed is final.
    async fn set_state(&self, new_state: IceAgentState) {
        let current_state = {
            let mut state_guard = self.state.write().await;
            let old_state = *state_guard;
            if old_state == IceAgentState::Closed {
                return;
            }
            *state_guard = new_state;
            old_state
        };

        if current_state != new_state {
            debug!("ICE agent state changed: {} -> {}", current_state, new_state);
            self.emit_event(IceAgentEvent::StateChange(new_state));
        }
    }

    /// Emit an event to listeners
    fn emit_event(&self, event: IceAgentEvent) {
        if self.event_tx.send(event).is_err() {
            trace!("ICE event dropped - receiver gone");
        }
    }

    /// Address the agent's socket is bound to
    pub async fn local_address(&self) -> Option<SocketAddr> {
        let socket = self.socket.read().await.clone()?;
        socket.local_addr().ok()
    }

    pub async fn local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates.read().await.clone()
    }

    pub async fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.read().await.clone()
    }

    /// Local and remote candidate of the selected pair
    pub async fn selected_pair(&self) -> Option<(IceCandidate, IceCandidate)> {
        self.selected_pair
            .read()
            .await
            .as_ref()
            .map(|p| (p.local.clone(), p.remote.clone()))
    }

    pub fn is_gathering_complete(&self) -> bool {
        self.gathering_complete.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> IceAgentStats {
        IceAgentStats {
            local_candidates: self.local_candidates.read().await.len(),
            remote_candidates: self.remote_candidates.read().await.len(),
            checklist_pairs: self.checklist.read().await.len(),
            checks_sent: self.checks_sent.load(Ordering::Relaxed),
            checks_succeeded: self.checks_succeeded.load(Ordering::Relaxed),
            server_failures: self.server_failures.load(Ordering::Relaxed),
        }
    }

    /// Byte-stream handle for the layers above
    pub fn transport(&self) -> IceTransport {
        IceTransport::new(self.clone())
    }

    /// Start gathering ICE candidates.
    ///
    /// Binds the socket and reports host candidates before returning; server
    /// candidates are gathered in the background and followed by
    /// [`IceAgentEvent::GatheringComplete`].
    pub async fn gather_candidates(&self) -> Result<()> {
        let state = self.state().await;
        if state != IceAgentState::New {
            return Err(Error::InvalidState(format!("cannot gather candidates in state {}", state)));
        }
        self.set_state(IceAgentState::Gathering).await;

        let socket = Arc::new(gather::bind_socket(&self.config)?);
        let local_addr = socket.local_addr()?;
        *self.socket.write().await = Some(socket.clone());

        let receiver = self.clone();
        let recv_socket = socket.clone();
        self.tasks.spawn("ice-recv", async move {
            receiver.receive_loop(recv_socket).await;
        });

        // Host candidates are immediate
        let addresses = gather::host_addresses(&self.config).await;
        for (index, ip) in addresses.iter().enumerate() {
            let local_preference = u16::MAX.saturating_sub(index as u16);
            let candidate = IceCandidate::host(
                SocketAddr::new(*ip, local_addr.port()),
                IceComponent::Rtp.id(),
                local_preference,
            );
            self.add_local_candidate(candidate).await;
        }

        let has_servers = !self.config.stun_servers.is_empty() || !self.config.turn_servers.is_empty();
        if self.config.gathering_policy == GatheringPolicy::HostOnly || !has_servers {
            self.finish_gathering().await;
            return Ok(());
        }

        let gatherer = self.clone();
        self.tasks.spawn("ice-gather", async move {
            gatherer.gather_server_candidates(socket).await;
        });

        Ok(())
    }

    async fn gather_server_candidates(&self, socket: Arc<UdpSocket>) {
        let Ok(base) = socket.local_addr() else {
            self.finish_gathering().await;
            return;
        };

        let stun_queries = self
            .config
            .stun_servers
            .iter()
            .map(|server| self.gather_server_reflexive(&socket, server, base));
        let turn_allocations = self
            .config
            .turn_servers
            .iter()
            .map(|server| self.gather_relay(&socket, server, base));

        futures::future::join(
            futures::future::join_all(stun_queries),
            futures::future::join_all(turn_allocations),
        )
        .await;

        self.finish_gathering().await;
    }

    async fn gather_server_reflexive(&self, socket: &UdpSocket, server: &str, base: SocketAddr) {
        let result = match gather::resolve_server(server, base).await {
            Ok(addr) => gather::query_server_reflexive(socket, &self.transactions, addr, &self.config).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(mapped) => {
                debug!("STUN server {} mapped us to {}", server, mapped);
                if !self.has_local_address(mapped).await {
                    let candidate = IceCandidate::server_reflexive(mapped, base, IceComponent::Rtp.id(), server);
                    self.add_local_candidate(candidate).await;
                }
            }
            Err(e) => {
                self.server_failures.fetch_add(1, Ordering::Relaxed);
                warn!("STUN server {} unusable: {}", server, e);
            }
        }
    }

    async fn gather_relay(&self, socket: &UdpSocket, server: &IceServerConfig, base: SocketAddr) {
        let result = match gather::resolve_server(&server.address, base).await {
            Ok(addr) => gather::allocate_relay(socket, &self.transactions, addr, server, &self.config).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(allocation) => {
                debug!("TURN server {} relays us on {}", server.address, allocation.relayed);
                let candidate = IceCandidate::relay(
                    allocation.relayed,
                    allocation.mapped,
                    IceComponent::Rtp.id(),
                    &server.address,
                );
                self.add_local_candidate(candidate).await;
            }
            Err(e) => {
                self.server_failures.fetch_add(1, Ordering::Relaxed);
                warn!("TURN server {} unusable: {}", server.address, e);
            }
        }
    }

    async fn has_local_address(&self, addr: SocketAddr) -> bool {
        self.local_candidates
            .read()
            .await
            .iter()
            .any(|c| c.socket_addr() == addr)
    }

    async fn finish_gathering(&self) {
        if self.gathering_complete.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.local_candidates.read().await.len();
        info!("ICE gathering complete with {} local candidates", count);

        if self.state().await == IceAgentState::Gathering {
            self.set_state(IceAgentState::Complete).await;
        }
        self.emit_event(IceAgentEvent::GatheringComplete);
    }

    async fn add_local_candidate(&self, candidate: IceCandidate) {
        debug!("New local candidate: {}", candidate);
        self.local_candidates.write().await.push(candidate.clone());
        self.emit_event(IceAgentEvent::NewCandidate(candidate.clone()));

        // Server-reflexive and relay candidates share the host base, so only
        // host candidates are paired
        if candidate.candidate_type == CandidateType::Host {
            let remotes = self.remote_candidates.read().await.clone();
            for remote in remotes {
                self.pair(&candidate, &remote).await;
            }
        }
    }

    async fn pair(&self, local: &IceCandidate, remote: &IceCandidate) -> bool {
        if local.component != remote.component || local.address.is_ipv4() != remote.address.is_ipv4() {
            return false;
        }
        let role = self.role().await;
        let added = self
            .checklist
            .write()
            .await
            .add_pair(local.clone(), remote.clone(), role);
        if added {
            trace!("Paired {} with {}", local.socket_addr(), remote.socket_addr());
        }
        added
    }

    /// Set the remote username fragment and password
    pub async fn set_remote_credentials(&self, credentials: IceCredentials) {
        debug!("Remote ICE credentials ufrag={}", credentials.ufrag);
        *self.remote_credentials.write().await = Some(credentials);
    }

    /// Add a remote candidate received over signaling
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let state = self.state().await;
        if state == IceAgentState::Closed {
            return Err(Error::Closed);
        }
        if candidate.transport != TransportType::Udp {
            debug!("Ignoring non-UDP remote candidate {}", candidate);
            return Ok(());
        }
        if candidate.component != IceComponent::Rtp.id() {
            debug!("Ignoring remote candidate for component {}", candidate.component);
            return Ok(());
        }
        if self.selected_pair.read().await.is_some() {
            trace!("Connectivity established, ignoring late candidate {}", candidate);
            return Ok(());
        }

        {
            let mut remotes = self.remote_candidates.write().await;
            if remotes.iter().any(|c| c.socket_addr() == candidate.socket_addr()) {
                return Ok(());
            }
            remotes.push(candidate.clone());
        }
        debug!("New remote candidate: {}", candidate);

        let locals: Vec<IceCandidate> = self
            .local_candidates
            .read()
            .await
            .iter()
            .filter(|c| c.candidate_type == CandidateType::Host)
            .cloned()
            .collect();
        for local in &locals {
            self.pair(local, &candidate).await;
        }
        Ok(())
    }

    /// Start connectivity checks. Requires remote credentials.
    pub async fn start_checks(&self) -> Result<()> {
        if self.remote_credentials.read().await.is_none() {
            return Err(Error::InvalidState("remote credentials not set".into()));
        }
        let state = self.state().await;
        if matches!(state, IceAgentState::Closed | IceAgentState::Failed) {
            return Err(Error::InvalidState(format!("cannot start checks in state {}", state)));
        }
        if self.socket.read().await.is_none() {
            return Err(Error::InvalidState("candidates have not been gathered".into()));
        }
        if self.checks_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(
            "Starting connectivity checks as {:?} with {} pairs",
            self.role().await,
            self.checklist.read().await.len()
        );
        self.set_state(IceAgentState::Checking).await;

        let checker = self.clone();
        self.tasks.spawn("ice-checks", async move {
            checker.run_checks().await;
        });
        Ok(())
    }

    /// Paces new checks until a pair is selected or the deadline passes
    async fn run_checks(&self) {
        let deadline = Instant::now() + self.config.connectivity_timeout();
        let mut ticker = time::interval(self.config.check_interval());

        loop {
            ticker.tick().await;

            if self.selected_pair.read().await.is_some() {
                return;
            }
            if matches!(self.state().await, IceAgentState::Closed | IceAgentState::Failed) {
                return;
            }
            if Instant::now() >= deadline {
                let pairs = self.checklist.read().await.len();
                warn!(
                    "No candidate pair succeeded within {:?} ({} pairs checked)",
                    self.config.connectivity_timeout(),
                    pairs
                );
                self.set_state(IceAgentState::Failed).await;
                return;
            }

            let next = self.checklist.write().await.next_to_check();
            if let Some(pair) = next {
                let checker = self.clone();
                self.tasks.spawn(format!("ice-check {}", pair), async move {
                    checker.perform_check(pair, false).await;
                });
            }
        }
    }

    fn check_policy(&self) -> RetransmitPolicy {
        RetransmitPolicy {
            initial_timeout: self.config.check_rto(),
            retransmits: self.config.max_check_retransmits,
            backoff: true,
        }
    }

    /// Build a signed Binding request for `pair`
    async fn build_check(&self, nominate: bool) -> Result<(StunMessage, Bytes)> {
        let remote = self
            .remote_credentials
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::InvalidState("remote credentials not set".into()))?;

        let prflx_priority = IceCandidate::compute_priority(
            CandidateType::PeerReflexive,
            u16::MAX,
            IceComponent::Rtp.id(),
        );
        let role_attribute = match self.role().await {
            IceRole::Controlling => StunAttribute::ice_controlling(self.tiebreaker),
            IceRole::Controlled => StunAttribute::ice_controlled(self.tiebreaker),
        };

        let mut request = StunMessage::binding_request()
            .with_attribute(StunAttribute::username(&format!(
                "{}:{}",
                remote.ufrag, self.local_credentials.ufrag
            )))
            .with_attribute(StunAttribute::priority(prflx_priority))
            .with_attribute(role_attribute);
        if nominate {
            request.add_attribute(StunAttribute::use_candidate());
        }
        let raw = request.encode_signed(remote.pwd.as_bytes())?;
        Ok((request, raw))
    }

    /// Boxed: a successful check may spawn a nominating check of its own
    fn perform_check(&self, pair: CandidatePair, nominate: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let key = pair.key();
            let outcome = self.run_check_transaction(&pair, nominate).await;

            match outcome {
                Ok(()) => {
                    self.checks_succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!("Check succeeded on {}{}", pair, if nominate { " (nomination)" } else { "" });
                    self.on_check_succeeded(key, nominate).await;
                }
                Err(Error::RoleConflict) => {
                    debug!("Check on {} hit a role conflict, retrying", pair);
                    if nominate {
                        self.nominating.store(false, Ordering::SeqCst);
                    }
                    self.checklist.write().await.trigger(key);
                }
                Err(e) => {
                    debug!("Check failed on {}: {}", pair, e);
                    if nominate {
                        self.nominating.store(false, Ordering::SeqCst);
                    }
                    let mut checklist = self.checklist.write().await;
                    if let Some(entry) = checklist.find_mut(key) {
                        if entry.state == CandidatePairState::InProgress {
                            entry.state = CandidatePairState::Failed;
                        }
                    }
                }
            }
        })
    }

    async fn run_check_transaction(&self, pair: &CandidatePair, nominate: bool) -> Result<()> {
        let socket = self.socket.read().await.clone().ok_or(Error::Closed)?;
        let (request, raw) = self.build_check(nominate).await?;
        let remote_pwd = self
            .remote_credentials
            .read()
            .await
            .as_ref()
            .map(|c| c.pwd.clone())
            .unwrap_or_default();

        self.checks_sent.fetch_add(1, Ordering::Relaxed);
        let reply: StunReply = transact(
            &socket,
            &self.transactions,
            request.transaction_id,
            &raw,
            pair.remote.socket_addr(),
            self.check_policy(),
        )
        .await?;

        if reply.from != pair.remote.socket_addr() {
            return Err(Error::ConnectivityError(format!(
                "non-symmetric response from {}",
                reply.from
            )));
        }

        match reply.message.msg_type.class {
            StunClass::SuccessResponse => {
                stun::check_fingerprint(&reply.raw)?;
                stun::check_integrity(&reply.raw, remote_pwd.as_bytes())?;
                Ok(())
            }
            StunClass::ErrorResponse => match reply.message.error_code() {
                Some((487, _)) => {
                    let role = self.role().await;
                    self.set_role(role.opposite()).await;
                    Err(Error::RoleConflict)
                }
                other => Err(Error::ConnectivityError(format!("check rejected: {:?}", other))),
            },
            _ => Err(Error::StunError("unexpected message class in response".into())),
        }
    }

    async fn on_check_succeeded(&self, key: (SocketAddr, SocketAddr), nomination: bool) {
        let known = {
            let mut checklist = self.checklist.write().await;
            match checklist.find_mut(key) {
                Some(pair) => {
                    pair.state = CandidatePairState::Succeeded;
                    true
                }
                None => false,
            }
        };
        if !known {
            return;
        }

        match self.role().await {
            IceRole::Controlling => {
                if nomination {
                    self.select_pair(key).await;
                } else if self.selected_pair.read().await.is_none()
                    && !self.nominating.swap(true, Ordering::SeqCst)
                {
                    let pair = self.checklist.read().await.find(key).cloned();
                    if let Some(pair) = pair {
                        let nominator = self.clone();
                        self.tasks.spawn(format!("ice-nominate {}", pair), async move {
                            nominator.perform_check(pair, true).await;
                        });
                    }
                }
            }
            IceRole::Controlled => {
                if self.selected_pair.read().await.is_none() {
                    self.select_pair(key).await;
                }
            }
        }
    }

    /// Select the pair with `key`. The first selection connects the agent and
    /// prunes the candidate sets.
    async fn select_pair(&self, key: (SocketAddr, SocketAddr)) {
        let Some(mut pair) = self.checklist.read().await.find(key).cloned() else {
            return;
        };
        pair.nominated = true;

        let first = {
            let mut selected = self.selected_pair.write().await;
            if selected.as_ref().map(|p| p.key()) == Some(key) {
                return;
            }
            let first = selected.is_none();
            *selected = Some(pair.clone());
            first
        };
        *self.last_inbound.lock() = Instant::now();

        info!("Selected candidate pair {}", pair);
        self.emit_event(IceAgentEvent::SelectedPair {
            local: pair.local.clone(),
            remote: pair.remote.clone(),
        });

        if first {
            self.set_state(IceAgentState::Connected).await;

            // Prune to the selected pair
            self.checklist.write().await.retain_key(key);
            self.remote_candidates
                .write()
                .await
                .retain(|c| c.socket_addr() == key.1);

            let keeper = self.clone();
            self.tasks.spawn("ice-consent", async move {
                keeper.consent_loop().await;
            });
        }
    }

    /// Sends consent requests on the selected pair and tracks inbound silence
    async fn consent_loop(&self) {
        let mut ticker = time::interval(self.config.keepalive_interval());
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(pair) = self.selected_pair.read().await.clone() else {
                continue;
            };
            let Some(socket) = self.socket.read().await.clone() else {
                return;
            };

            match self.build_check(false).await {
                Ok((_, raw)) => {
                    if let Err(e) = socket.send_to(&raw, pair.remote.socket_addr()).await {
                        debug!("Consent request to {} failed: {}", pair.remote.socket_addr(), e);
                    }
                }
                Err(e) => debug!("Cannot build consent request: {}", e),
            }

            let silence = self.last_inbound.lock().elapsed();
            if silence > self.config.consent_timeout() && self.state().await == IceAgentState::Connected {
                warn!("No traffic from {} for {:?}", pair.remote.socket_addr(), silence);
                self.set_state(IceAgentState::Disconnected).await;
            }
        }
    }

    async fn receive_loop(&self, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors surface here on some platforms; keep reading
                    debug!("ICE socket receive error: {}", e);
                    time::sleep(self.config.check_interval()).await;
                    continue;
                }
            };
            if len == 0 {
                continue;
            }

            let data = &buf[..len];
            self.note_inbound(from).await;

            match data[0] {
                0..=3 => self.handle_stun(data, from).await,
                20..=63 | 128..=191 => {
                    if let Err(e) = self.data_tx.try_send(Bytes::copy_from_slice(data)) {
                        trace!("Dropping {} byte datagram from {}: {}", len, from, e);
                    }
                }
                other => trace!("Dropping datagram with first byte {} from {}", other, from),
            }
        }
    }

    async fn note_inbound(&self, from: SocketAddr) {
        let from_selected = self
            .selected_pair
            .read()
            .await
            .as_ref()
            .map(|p| p.remote.socket_addr() == from)
            .unwrap_or(false);
        if !from_selected {
            return;
        }

        *self.last_inbound.lock() = Instant::now();
        if self.state().await == IceAgentState::Disconnected {
            info!("Traffic from {} resumed", from);
            self.set_state(IceAgentState::Connected).await;
        }
    }

    async fn handle_stun(&self, data: &[u8], from: SocketAddr) {
        let message = match StunMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                trace!("Undecodable STUN datagram from {}: {}", from, e);
                return;
            }
        };
        if let Err(e) = stun::check_fingerprint(data) {
            debug!("Dropping STUN message from {}: {}", from, e);
            return;
        }

        match message.msg_type.class {
            StunClass::Request if message.msg_type.method == METHOD_BINDING => {
                if let Err(e) = self.handle_binding_request(message, data, from).await {
                    debug!("Binding request from {} not answered: {}", from, e);
                }
            }
            StunClass::SuccessResponse | StunClass::ErrorResponse => {
                let reply = StunReply {
                    message,
                    raw: Bytes::copy_from_slice(data),
                    from,
                };
                if !self.transactions.resolve(reply) {
                    trace!("Response from {} matches no transaction", from);
                }
            }
            _ => trace!("Ignoring STUN {:?} from {}", message.msg_type, from),
        }
    }

    async fn handle_binding_request(&self, request: StunMessage, raw: &[u8], from: SocketAddr) -> Result<()> {
        let socket = self.socket.read().await.clone().ok_or(Error::Closed)?;
        let local_pwd = self.local_credentials.pwd.as_bytes();

        let expected_prefix = format!("{}:", self.local_credentials.ufrag);
        let authentic = request
            .username()
            .map(|u| u.starts_with(&expected_prefix))
            .unwrap_or(false)
            && stun::check_integrity(raw, local_pwd).is_ok();
        if !authentic {
            let response = StunMessage::error_response(&request, 401, "Unauthorized");
            socket.send_to(&response.encode_with_fingerprint(), from).await?;
            return Err(Error::IntegrityCheckFailed);
        }

        // Role conflict resolution, RFC 8445 section 7.3.1.1
        let role = self.role().await;
        match (role, request.ice_controlling(), request.ice_controlled()) {
            (IceRole::Controlling, Some(theirs), _) => {
                if self.tiebreaker >= theirs {
                    let response = StunMessage::error_response(&request, 487, "Role Conflict");
                    socket.send_to(&response.encode_signed(local_pwd)?, from).await?;
                    return Ok(());
                }
                self.set_role(IceRole::Controlled).await;
            }
            (IceRole::Controlled, _, Some(theirs)) => {
                if self.tiebreaker >= theirs {
                    self.set_role(IceRole::Controlling).await;
                } else {
                    let response = StunMessage::error_response(&request, 487, "Role Conflict");
                    socket.send_to(&response.encode_signed(local_pwd)?, from).await?;
                    return Ok(());
                }
            }
            _ => {}
        }

        let mut response = StunMessage::success_response(&request);
        response.add_attribute(StunAttribute::xor_mapped_address(from, &request.transaction_id));
        socket.send_to(&response.encode_signed(local_pwd)?, from).await?;
        trace!("Answered binding request from {}", from);

        let key = self.learn_remote(from, request.priority().unwrap_or(0)).await;
        let Some(key) = key else {
            return Ok(());
        };

        if request.use_candidate() && self.role().await == IceRole::Controlled {
            debug!("Remote nominated {} -> {}", key.0, key.1);
            self.checklist.write().await.set_state(key, CandidatePairState::Succeeded);
            self.select_pair(key).await;
        } else if self.selected_pair.read().await.is_none()
            && self.remote_credentials.read().await.is_some()
        {
            self.checklist.write().await.trigger(key);
        }
        Ok(())
    }

    /// Find the pair for a request from `from`, learning a peer-reflexive
    /// remote candidate when the address is unknown
    async fn learn_remote(&self, from: SocketAddr, priority: u32) -> Option<(SocketAddr, SocketAddr)> {
        let remote = {
            let mut remotes = self.remote_candidates.write().await;
            match remotes.iter().find(|c| c.socket_addr() == from) {
                Some(existing) => existing.clone(),
                None => {
                    let learnt = IceCandidate::peer_reflexive(from, IceComponent::Rtp.id(), priority);
                    debug!("Learnt peer-reflexive candidate {}", learnt);
                    remotes.push(learnt.clone());
                    learnt
                }
            }
        };

        let locals: Vec<IceCandidate> = self
            .local_candidates
            .read()
            .await
            .iter()
            .filter(|c| c.candidate_type == CandidateType::Host)
            .cloned()
            .collect();
        for local in &locals {
            self.pair(local, &remote).await;
        }

        self.checklist
            .read()
            .await
            .pairs()
            .iter()
            .find(|p| p.remote.socket_addr() == from)
            .map(|p| p.key())
    }

    /// Send a datagram to the selected remote candidate
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        let remote = self
            .selected_pair
            .read()
            .await
            .as_ref()
            .map(|p| p.remote.socket_addr())
            .ok_or_else(|| Error::InvalidState("no selected candidate pair".into()))?;
        let socket = self.socket.read().await.clone().ok_or(Error::Closed)?;
        Ok(socket.send_to(data, remote).await?)
    }

    /// Next inbound non-STUN datagram, or `Error::Closed` once the agent closes
    pub(crate) async fn recv(&self) -> Result<Bytes> {
        let token = self.tasks.token();
        let mut rx = self.data_rx.lock().await;
        tokio::select! {
            data = rx.recv() => data.ok_or(Error::Closed),
            _ = token.cancelled() => Err(Error::Closed),
        }
    }

    /// Close the agent: cancel every task, wait up to the grace period and
    /// release the socket
    pub async fn close(&self) -> Result<()> {
        if self.state().await == IceAgentState::Closed {
            return Ok(());
        }
        self.set_state(IceAgentState::Closed).await;

        let graceful = self.tasks.shutdown(self.config.close_grace()).await;
        self.transactions.clear();
        self.socket.write().await.take();
        *self.selected_pair.write().await = None;

        if graceful {
            debug!("ICE agent {} closed", self.local_credentials.ufrag);
        } else {
            warn!("ICE agent {} closed after aborting tasks", self.local_credentials.ufrag);
        }
        Ok(())
    }

    /// Number of tasks still running, for leak checks
    pub fn active_tasks(&self) -> usize {
        self.tasks.active_task_count()
    }
}

impl std::fmt::Debug for IceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceAgent")
            .field("ufrag", &self.local_credentials.ufrag)
            .field("tiebreaker", &self.tiebreaker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_credentials_are_ice_chars() {
        let credentials = IceCredentials::generate();
        assert_eq!(credentials.ufrag.len(), 8);
        assert_eq!(credentials.pwd.len(), 24);
        assert!(credentials.pwd.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(credentials, IceCredentials::generate());
    }

    #[tokio::test]
    async fn checks_require_remote_credentials() {
        let (agent, _events) = IceAgent::new(IceConfig::loopback(), IceRole::Controlling).unwrap();
        agent.gather_candidates().await.unwrap();
        assert!(matches!(agent.start_checks().await, Err(Error::InvalidState(_))));
        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn gathering_twice_is_rejected() {
        let (agent, mut events) = IceAgent::new(IceConfig::loopback(), IceRole::Controlled).unwrap();
        agent.gather_candidates().await.unwrap();
        assert!(agent.gather_candidates().await.is_err());

        let mut saw_candidate = false;
        let mut saw_complete = false;
        while let Ok(event) = events.try_recv() {
            match event {
                IceAgentEvent::NewCandidate(c) => {
                    saw_candidate = true;
                    assert_eq!(c.candidate_type, CandidateType::Host);
                }
                IceAgentEvent::GatheringComplete => saw_complete = true,
                _ => {}
            }
        }
        assert!(saw_candidate && saw_complete);
        assert_eq!(agent.state().await, IceAgentState::Complete);
        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_without_selected_pair_fails() {
        let (agent, _events) = IceAgent::new(IceConfig::loopback(), IceRole::Controlling).unwrap();
        agent.gather_candidates().await.unwrap();
        assert!(matches!(agent.send(b"data").await, Err(Error::InvalidState(_))));
        agent.close().await.unwrap();
        assert_eq!(agent.state().await, IceAgentState::Closed);
        assert!(agent.local_address().await.is_none());
    }

    #[tokio::test]
    async fn nominating_check_runs_on_its_own_task() {
        let (agent, _events) = IceAgent::new(IceConfig::loopback(), IceRole::Controlling).unwrap();
        agent.gather_candidates().await.unwrap();
        let local = agent.local_candidates().await.remove(0);
        let remote = IceCandidate::host("127.0.0.1:9".parse().unwrap(), IceComponent::Rtp.id(), 65535);
        let pair = CandidatePair::new(local, remote, IceRole::Controlling);

        agent.nominating.store(true, Ordering::SeqCst);
        let checker = agent.clone();
        tokio::spawn(async move { checker.perform_check(pair, true).await })
            .await
            .unwrap();

        // No remote credentials: the nomination fails and frees the slot
        assert!(!agent.nominating.load(Ordering::SeqCst));
        assert!(agent.selected_pair().await.is_none());
        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn unauthenticated_request_gets_401() {
        let (agent, _events) = IceAgent::new(IceConfig::loopback(), IceRole::Controlled).unwrap();
        agent.gather_candidates().await.unwrap();
        let target = agent.local_address().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = StunMessage::binding_request()
            .with_attribute(StunAttribute::username(&format!("{}:peer", agent.local_credentials().ufrag)));
        client
            .send_to(&request.encode_signed(b"wrong-password").unwrap(), target)
            .await
            .unwrap();

        let mut buf = [0u8; 1500];
        let (len, _) = time::timeout(std::time::Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = StunMessage::decode(&buf[..len]).unwrap();
        assert_eq!(response.transaction_id, request.transaction_id);
        assert_eq!(response.error_code().map(|(code, _)| code), Some(401));
        assert!(agent.remote_candidates().await.is_empty());

        agent.close().await.unwrap();
    }
}
