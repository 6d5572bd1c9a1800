// Copyright (c) 2018-2022 The Botho Foundation

//! The Gossip Service (L7): the top-level orchestrator wiring the Identity
//! Mapper, Message Store, Batching Emitter, Discovery, Channel State, and
//! Transport Adapter together, and `handleMessage`'s dispatch tree (spec.md
//! §4.7).

use crate::{
    channel::{Channel, ChannelFile, ChannelInfo, ChannelRegistry},
    config::GossipConfig,
    datasync::DataSyncHandler,
    discovery::{policy::DisclosurePolicy, select_pull_targets, Discovery},
    emitter::{EmitFn, EmittedMessage, Emitter, EmitterConfig},
    error::{GossipError, GossipResult},
    fs::FileSystemAdapter,
    identity::IdentityMapper,
    message::{self, pki_from_bytes, SignedMessage},
    store::{Comparison, MessageComparator, MessageStore},
    types::{select_peers, NetworkMember, PeerSelector, Publisher},
};
use rksync_common::{PkiId, SigningIdentity};
use rksync_transport::{
    proto::{self, r_k_sync_message::Content, ConnEstablish},
    ReceivedMessage, RKSyncServer, ResolveRemote, TransportAdapter, TransportError,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use tokio::{sync::Mutex as AsyncMutex, sync::Notify, task::JoinHandle};
use tracing::{debug, error, warn};

/// Chain-state dedup, keyed by chainMac: the incoming state with the
/// highest `seqNum` wins; a tie is broken bytewise on the payload, stably
/// (spec.md §4.2, §4.6).
struct ChainStateComparator;

impl MessageComparator<proto::ChainState> for ChainStateComparator {
    fn compare(&self, incoming: &proto::ChainState, existing: &proto::ChainState) -> Comparison {
        if incoming.chain_mac != existing.chain_mac {
            return Comparison::Distinct;
        }
        match incoming.seq_num.cmp(&existing.seq_num) {
            std::cmp::Ordering::Greater => Comparison::Supersedes,
            std::cmp::Ordering::Less => Comparison::Stale,
            std::cmp::Ordering::Equal => {
                if incoming.payload == existing.payload {
                    Comparison::Equal
                } else if incoming.payload > existing.payload {
                    Comparison::Supersedes
                } else {
                    Comparison::Stale
                }
            }
        }
    }
}

/// Everything [`GossipService::new`] needs beyond [`GossipConfig`]: the
/// node's signing identity and its external collaborators (spec.md §1).
pub struct GossipServiceDeps {
    /// This node's signing keypair and certificate-bound identity.
    pub signing_identity: SigningIdentity,
    /// The Transport Adapter (L4) this service drives.
    pub transport: Arc<TransportAdapter>,
    /// The file-system adapter injected into every channel this node joins.
    pub fs: Arc<dyn FileSystemAdapter>,
    /// The data-sync handler injected into every channel this node joins.
    pub data_sync: Arc<dyn DataSyncHandler>,
    /// The disclosure policy Discovery consults (spec.md §4.5).
    pub disclosure_policy: Box<dyn DisclosurePolicy>,
    /// This node's boot epoch (`PeerTime.incNum`); the embedder is
    /// responsible for making it monotonic across restarts.
    pub inc_num: u64,
}

/// The top-level orchestrator.
pub struct GossipService {
    config: GossipConfig,
    self_pki_id: PkiId,
    identity: Arc<IdentityMapper>,
    transport: Arc<TransportAdapter>,
    emitter: Arc<Emitter>,
    discovery: Arc<Discovery>,
    channels: Arc<ChannelRegistry>,
    chain_state_store: MessageStore<proto::ChainState, ChainStateComparator>,
    fs: Arc<dyn FileSystemAdapter>,
    data_sync: Arc<dyn DataSyncHandler>,
    shutdown: Notify,
    stopped: AtomicBool,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl GossipService {
    /// Build the service and wire every leaf component. Does not start any
    /// background task; call [`GossipService::spawn`].
    pub fn new(config: GossipConfig, deps: GossipServiceDeps) -> Arc<Self> {
        let identity = Arc::new(IdentityMapper::new(deps.signing_identity));
        let self_pki_id = identity.self_pki_id();

        // `Discovery` doesn't exist yet when the emitter's `emit` closure is
        // built, but the closure needs Discovery's live membership to turn
        // a message's abstract filter into a concrete peer list. A small
        // `OnceLock` set immediately after `Discovery::new` breaks the
        // construction-order cycle without giving the emitter a persistent
        // back-reference to the whole service (spec.md §9's "explicit small
        // interfaces", applied one level further than `PeerSelector` alone).
        let discovery_cell: Arc<OnceLock<Arc<Discovery>>> = Arc::new(OnceLock::new());

        let emit: EmitFn = {
            let transport = deps.transport.clone();
            let discovery_cell = discovery_cell.clone();
            let propagate_peer_num = config.propagate_peer_num;
            let self_pki_id = self_pki_id;
            Arc::new(move |batch: &[EmittedMessage]| {
                let Some(discovery) = discovery_cell.get() else {
                    warn!("emitter flushed before discovery was wired; dropping burst");
                    return;
                };
                let alive = discovery.alive_members();
                for message in batch {
                    let candidates: Vec<NetworkMember> = alive
                        .iter()
                        .filter(|m| m.pki_id != self_pki_id && (message.filter)(m))
                        .cloned()
                        .collect();
                    let targets: Vec<PkiId> = select_peers(propagate_peer_num, &candidates, |_| true)
                        .into_iter()
                        .map(|m| m.pki_id)
                        .collect();
                    if !targets.is_empty() {
                        transport.send(&message.envelope, &targets);
                    }
                }
            })
        };

        let emitter = Emitter::new(
            EmitterConfig {
                max_burst_size: config.max_propagation_burst_size,
                max_burst_latency: config.max_propagation_burst_latency(),
            },
            emit,
        );

        let discovery = Discovery::new(
            config.clone(),
            deps.inc_num,
            identity.clone(),
            emitter.clone() as Arc<dyn Publisher>,
            deps.disclosure_policy,
        );
        let _ = discovery_cell.set(discovery.clone());

        Arc::new(Self {
            config,
            self_pki_id,
            identity,
            transport: deps.transport,
            emitter,
            discovery,
            channels: Arc::new(ChannelRegistry::new()),
            chain_state_store: MessageStore::new(ChainStateComparator),
            fs: deps.fs,
            data_sync: deps.data_sync,
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
            tasks: AsyncMutex::new(Vec::new()),
        })
    }

    /// This node's own PKI-id.
    pub fn self_pki_id(&self) -> PkiId {
        self.self_pki_id
    }

    /// `Peers()`: every *other* member Discovery currently considers alive.
    /// `alive_members()` always includes self (callers like the emitter's
    /// filter evaluation and `select_pull_targets` need self present to
    /// exclude it explicitly), so filter it back out here.
    pub fn peers(&self) -> Vec<NetworkMember> {
        self.discovery
            .alive_members()
            .into_iter()
            .filter(|m| m.pki_id != self.self_pki_id)
            .collect()
    }

    /// `CreateChannel(chainId, files)`: join as leader, idempotent.
    pub fn create_channel(&self, chain_id: impl Into<String>, files: Vec<ChannelFile>) -> GossipResult<proto::ChainState> {
        let chain_id = chain_id.into();
        let channel = self.channels.join_as_leader(
            chain_id,
            vec![self.self_pki_id],
            files,
            self.identity.clone(),
            self.emitter.clone() as Arc<dyn Publisher>,
            self.discovery.clone() as Arc<dyn PeerSelector>,
            self.fs.clone(),
            self.data_sync.clone(),
            self.config.clone(),
        )?;
        channel.spawn_pull_loop();
        channel.current_state().ok_or_else(|| GossipError::InvalidInput("channel has no state immediately after creation".into()))
    }

    /// `InitializeChannel`/explicit follower join: idempotent. `leader` may
    /// be `None` if only the chainMac is known so far; the first adopted
    /// `ChainState` resolves it.
    pub fn join_channel_as_follower(&self, chain_id: impl Into<String>, leader: Option<PkiId>) -> Arc<Channel> {
        let chain_id = chain_id.into();
        let channel = self.channels.join_as_follower(
            chain_id,
            leader,
            self.self_pki_id,
            self.identity.clone(),
            self.emitter.clone() as Arc<dyn Publisher>,
            self.discovery.clone() as Arc<dyn PeerSelector>,
            self.fs.clone(),
            self.data_sync.clone(),
            self.config.clone(),
        );
        channel.spawn_pull_loop();
        channel
    }

    /// `AddMemberToChan(chainId, pkiId)`: leader only.
    pub fn add_member_to_channel(&self, chain_id: &str, pki_id: PkiId) -> GossipResult<proto::ChainState> {
        self.channel_or_not_found(chain_id)?.add_member(pki_id)
    }

    /// `AddFile(chainId, file)`: leader only.
    pub fn add_file_to_channel(&self, chain_id: &str, file: ChannelFile) -> GossipResult<proto::ChainState> {
        self.channel_or_not_found(chain_id)?.add_file(file)
    }

    /// `SelfChannelInfo(chainId)`.
    pub fn self_channel_info(&self, chain_id: &str) -> GossipResult<ChannelInfo> {
        Ok(self.channel_or_not_found(chain_id)?.self_channel_info())
    }

    /// `CloseChannel(chainId)`.
    pub fn close_channel(&self, chain_id: &str) {
        self.channels.close_channel(chain_id);
    }

    fn channel_or_not_found(&self, chain_id: &str) -> GossipResult<Arc<Channel>> {
        self.channels
            .resolve_by_chain_id(chain_id)
            .ok_or_else(|| GossipError::NotFound(format!("no channel named {chain_id}")))
    }

    /// `Put`/`Get` on the Identity Mapper, exposed through the service for
    /// embedders that need to prime identities out of band.
    pub fn identity(&self) -> &Arc<IdentityMapper> {
        &self.identity
    }

    /// `handleMessage(m)` (spec.md §4.7). `from` is the sender confirmed at
    /// transport handshake time.
    fn handle_message(&self, received: ReceivedMessage) {
        let signed = match SignedMessage::decode(received.envelope) {
            Ok(signed) => signed,
            Err(e) => {
                warn!(from = %received.from, error = %e, "dropping malformed envelope");
                return;
            }
        };

        if let Err(e) = signed.check_tag_legality() {
            warn!(from = %received.from, error = %e, "dropping message with illegal tag");
            return;
        }

        if signed.is_chain_state_msg() {
            self.handle_chain_state(signed, received.from);
        } else if signed.is_channel_restricted() {
            self.handle_channel_restricted(signed, received.from);
        } else {
            match self.verify_discovery_message(&signed, received.from) {
                Ok(()) => self.handle_discovery(signed, received.from),
                Err(e) => warn!(from = %received.from, error = %e, "discarding unverifiable discovery message"),
            }
        }
    }

    fn verify_discovery_message(&self, signed: &SignedMessage, from: PkiId) -> GossipResult<()> {
        if let Some(Content::MemReq(req)) = &signed.inner.content {
            let claimed = req
                .self_information
                .as_ref()
                .and_then(|a| a.membership.as_ref())
                .and_then(|m| pki_from_bytes(&m.pki_id));
            if claimed != Some(from) {
                return Err(GossipError::InvalidInput(
                    "membership request self-info pki-id does not match handshake sender".into(),
                ));
            }
        }
        signed.verify_against(&self.identity, from)
    }

    fn handle_chain_state(&self, signed: SignedMessage, from: PkiId) {
        let Some(Content::ChainState(state)) = signed.inner.content else { return };

        self.emitter.publish(EmittedMessage::excluding(signed.envelope, from, self.config.propagate_iterations));

        if !self.chain_state_store.add(state.clone(), None) {
            debug!(chain_id = %state.chain_id, "chain state already seen or stale, not re-delivering");
            return;
        }

        let channel = match self.channels.resolve_by_chain_id(&state.chain_id) {
            Some(channel) => channel,
            None => match self.maybe_join_as_follower(&state) {
                Some(channel) => channel,
                None => {
                    debug!(chain_id = %state.chain_id, "self not a declared member; not joining");
                    return;
                }
            },
        };

        match channel.adopt_chain_state(state) {
            Ok(true) => self.channels.reindex_mac(&channel),
            Ok(false) => {}
            Err(e) => warn!(chain_id = %channel.chain_id(), error = %e, "rejected chain state"),
        }
    }

    fn maybe_join_as_follower(&self, state: &proto::ChainState) -> Option<Arc<Channel>> {
        let info = prost::Message::decode(state.payload.as_slice())
            .ok()
            .and_then(|info: proto::ChainStateInfo| {
                let leader = pki_from_bytes(&info.leader)?;
                let members: Vec<PkiId> = info.members.iter().filter_map(|b| pki_from_bytes(b)).collect();
                Some((leader, members))
            });
        let (leader, members) = info?;
        if !members.contains(&self.self_pki_id) {
            return None;
        }
        Some(self.join_channel_as_follower(state.chain_id.clone(), Some(leader)))
    }

    fn handle_channel_restricted(&self, signed: SignedMessage, from: PkiId) {
        let Some(chain_mac) = signed.chain_mac().map(<[u8]>::to_vec) else { return };
        let Some(channel) = self.channels.resolve_by_mac(&chain_mac) else {
            debug!("dropping channel-restricted message for unknown chainMac");
            return;
        };

        match signed.inner.content {
            Some(Content::ChainStatePullReq(_)) => {
                if let Some(state) = channel.current_state() {
                    let response = proto::ChainStatePullResponse { element: Some(state) };
                    let envelope = self.sign_channel_message(&channel, Content::ChainStatePullRes(response));
                    self.emitter.publish(EmittedMessage::to_peers(envelope, vec![from], 1));
                }
            }
            Some(Content::ChainStatePullRes(res)) => {
                if let Some(state) = res.element {
                    if let Err(e) = channel.adopt_chain_state(state) {
                        warn!(chain_id = %channel.chain_id(), error = %e, "rejected pulled chain state");
                    } else {
                        self.channels.reindex_mac(&channel);
                    }
                }
            }
            Some(Content::ChainStateInfo(_)) => {
                // Carried only embedded inside a `ChainState.payload`; a
                // bare top-level `ChainStateInfo` message has no defined
                // handling beyond the data-sync extension point.
                if let Err(e) = channel.handle_data_sync(from, &signed.envelope.payload) {
                    warn!(chain_id = %channel.chain_id(), error = %e, "data sync handler rejected payload");
                }
            }
            _ => {
                if let Err(e) = channel.handle_data_sync(from, &signed.envelope.payload) {
                    warn!(chain_id = %channel.chain_id(), error = %e, "data sync handler rejected payload");
                }
            }
        }
    }

    fn sign_channel_message(&self, channel: &Channel, content: Content) -> proto::Envelope {
        let inner = proto::RkSyncMessage {
            nonce: 0,
            channel: channel.chain_mac(),
            tag: proto::r_k_sync_message::Tag::ChanOnly as i32,
            content: Some(content),
        };
        message::sign_with_identity(&self.identity, inner)
    }

    fn handle_discovery(&self, signed: SignedMessage, from: PkiId) {
        match signed.inner.content {
            Some(Content::AliveMsg(alive)) => {
                if let Err(e) = self.discovery.handle_alive(alive, from) {
                    warn!(%from, error = %e, "rejected alive message");
                }
            }
            Some(Content::MemReq(req)) => {
                let response = self.discovery.handle_membership_request(req);
                let inner = proto::RkSyncMessage {
                    nonce: 0,
                    channel: Vec::new(),
                    tag: proto::r_k_sync_message::Tag::Empty as i32,
                    content: Some(Content::MemRes(response)),
                };
                let envelope = message::sign_with_identity(&self.identity, inner);
                self.emitter.publish(EmittedMessage::to_peers(envelope, vec![from], 1));
            }
            Some(Content::MemRes(res)) => {
                self.discovery.handle_membership_response(res);
            }
            _ => {
                warn!(%from, "dropping unrecognized discovery content");
            }
        }
    }

    /// Launch the four independent loops (spec.md §4.7, §9): accept, sync
    /// (membership pull), presumed-dead, and the one-shot bootstrap
    /// connect. Also starts the emitter's and discovery's own timer tasks.
    ///
    /// Two-node bootstrap walkthrough (spec.md §8 scenario 1): build node A
    /// with `bootstrap_peers: vec![]` and an `endpoint` it can bind, build
    /// node B the same way but with `bootstrap_peers: vec![A's endpoint]`,
    /// call `spawn()` on both. B's `connect_bootstrap_peers` dials A's
    /// accept server (started by this same call), exchanges signed
    /// `ConnEstablish`s, and records A in its discovery table; A learns of B
    /// symmetrically once B's next `emit_alive` round reaches it. Within one
    /// `pull_interval`, `a.peers()` contains B and `b.peers()` contains A.
    pub async fn spawn(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.emitter.spawn());
        tasks.push(self.discovery.spawn());
        tasks.push(self.spawn_accept_loop());
        tasks.push(self.spawn_sync_loop());
        tasks.push(self.spawn_presumed_dead_loop());
        tasks.push(self.spawn_identity_sweep_loop());
        if let Some(server) = self.spawn_server_loop() {
            tasks.push(server);
        }
        drop(tasks);

        self.connect_bootstrap_peers().await;
    }

    fn resolve_remote_identity(&self) -> ResolveRemote {
        let identity = self.identity.clone();
        Arc::new(move |establish: &ConnEstablish| {
            let claimed = pki_from_bytes(&establish.pki_id)
                .ok_or_else(|| TransportError::InvalidEndpoint("malformed pki-id".into()))?;
            let peer_identity = crate::identity::decode_identity(&establish.identity)
                .ok_or_else(|| TransportError::InvalidEndpoint("malformed identity".into()))?;
            identity
                .put(claimed, peer_identity)
                .map_err(|_| TransportError::InvalidEndpoint("identity conflict".into()))?;
            Ok(claimed)
        })
    }

    /// Bind this node's advertised `endpoint` and accept inbound `SyncStream`
    /// connections. An endpoint that doesn't parse as a socket address (e.g.
    /// a bare hostname used only in tests) is logged and skipped rather than
    /// treated as fatal: plenty of embedders drive the accept side through
    /// their own listener and only use this engine for the client half.
    fn spawn_server_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let addr: SocketAddr = match self.config.endpoint.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(endpoint = %self.config.endpoint, error = %e, "endpoint is not a bindable socket address; accept server not started");
                return None;
            }
        };

        let self_establish = ConnEstablish {
            pki_id: self.self_pki_id.as_bytes().to_vec(),
            identity: crate::identity::encode_identity(self.identity.self_identity()),
        };
        let server = RKSyncServer::new(self.transport.clone(), self_establish, self.resolve_remote_identity());

        let this = self.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move { this.shutdown.notified().await };
            if let Err(e) = server.serve(addr, shutdown).await {
                error!(%addr, error = %e, "accept server exited with error");
            }
        }))
    }

    fn spawn_accept_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut accepted = this.transport.accept(|_| true);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = accepted.recv() => {
                        match received {
                            Some(message) => this.handle_message(message),
                            None => break,
                        }
                    }
                    _ = this.shutdown.notified() => break,
                }
            }
        })
    }

    fn spawn_sync_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.pull_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.sync_discovery(),
                    _ = this.shutdown.notified() => break,
                }
            }
        })
    }

    fn sync_discovery(&self) {
        rksync_common::trace_time!("discovery::sync_loop");
        let targets = select_pull_targets(&self.discovery, self.config.pull_peer_num);
        if targets.is_empty() {
            return;
        }
        let request = self.discovery.build_membership_request();
        let inner = proto::RkSyncMessage {
            nonce: 0,
            channel: Vec::new(),
            tag: proto::r_k_sync_message::Tag::Empty as i32,
            content: Some(Content::MemReq(request)),
        };
        let envelope = message::sign_with_identity(&self.identity, inner);
        self.emitter.publish(EmittedMessage::to_peers(envelope, targets, 1));
    }

    /// Periodically sweep the Identity Mapper for entries unused longer than
    /// `identityTtl`, closing the transport connection to each purged peer
    /// (spec.md §4.1's `Sweep`: "on purge, invokes a caller-supplied
    /// notifier (used by the service to close the transport connection)").
    fn spawn_identity_sweep_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.alive_time_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ttl = this.config.identity_ttl();
                        let transport = this.transport.clone();
                        this.identity.sweep(ttl, |pki_id| {
                            debug!(%pki_id, "identity ttl expired, closing connection");
                            transport.close_conn(pki_id);
                        });
                    }
                    _ = this.shutdown.notified() => break,
                }
            }
        })
    }

    fn spawn_presumed_dead_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    pki_id = this.transport.next_presumed_dead() => {
                        match pki_id {
                            Some(pki_id) => this.discovery.mark_presumed_dead(pki_id),
                            None => break,
                        }
                    }
                    _ = this.shutdown.notified() => break,
                }
            }
        })
    }

    async fn connect_bootstrap_peers(self: &Arc<Self>) {
        for endpoint in self.config.bootstrap_peers.clone() {
            let self_identity_bytes = crate::identity::encode_identity(self.identity.self_identity());
            let resolve_remote = self.resolve_remote_identity();
            let resolve_remote = move |establish: &ConnEstablish| resolve_remote(establish);

            match self.transport.handshake(&endpoint, self_identity_bytes, resolve_remote).await {
                Ok(pki_id) => {
                    self.discovery.note_peer(NetworkMember::new(endpoint.clone(), pki_id, Vec::new()));
                    debug!(%endpoint, %pki_id, "connected to bootstrap peer");
                }
                Err(e) => error!(%endpoint, error = %e, "failed to connect to bootstrap peer"),
            }
        }
    }

    /// Stop sequence (spec.md §5): set the stop flag, stop discovery and
    /// every channel's pull loop, broadcast shutdown to the remaining
    /// loops, stop the emitter, and await every spawned task.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.discovery.stop();
        for channel in self.channels.channels() {
            channel.stop();
        }
        self.shutdown.notify_waiters();
        self.emitter.stop();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }

    /// Whether [`GossipService::shutdown`] has run.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
