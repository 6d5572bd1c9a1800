// Copyright (c) 2018-2022 The Botho Foundation

//! Channel State (L6): per-channel leader/member/file-manifest state
//! machine, chainMac integrity binding, and pull-based reconciliation
//! (spec.md §4.6).

use crate::{
    config::GossipConfig,
    datasync::DataSyncHandler,
    emitter::EmittedMessage,
    error::{GossipError, GossipResult},
    fs::FileSystemAdapter,
    identity::IdentityMapper,
    message::{self, pki_from_bytes},
    types::{select_peers, NetworkMember, PeerSelector, Publisher},
};
use prost::Message as _;
use rksync_common::PkiId;
use rksync_transport::proto::{self, r_k_sync_message::Content, r_k_sync_message::Tag, ChainState, ChainStateInfo};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, warn};

/// A channel file manifest entry's transfer mode (spec.md §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelFileMode {
    /// Append-only writes.
    Append,
    /// Random-access writes.
    Random,
}

impl From<proto::chain_file::Mode> for ChannelFileMode {
    fn from(mode: proto::chain_file::Mode) -> Self {
        match mode {
            proto::chain_file::Mode::Append => ChannelFileMode::Append,
            proto::chain_file::Mode::Random => ChannelFileMode::Random,
        }
    }
}

impl From<ChannelFileMode> for proto::chain_file::Mode {
    fn from(mode: ChannelFileMode) -> Self {
        match mode {
            ChannelFileMode::Append => proto::chain_file::Mode::Append,
            ChannelFileMode::Random => proto::chain_file::Mode::Random,
        }
    }
}

/// `{path, mode}` (spec.md §3's channel file manifest entry).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelFile {
    /// Manifest path, resolved through the injected [`FileSystemAdapter`].
    pub path: String,
    /// Transfer mode.
    pub mode: ChannelFileMode,
}

impl ChannelFile {
    /// Build a manifest entry.
    pub fn new(path: impl Into<String>, mode: ChannelFileMode) -> Self {
        Self { path: path.into(), mode }
    }

    fn to_proto(&self) -> proto::ChainFile {
        proto::ChainFile {
            path: self.path.clone(),
            mode: proto::chain_file::Mode::from(self.mode) as i32,
        }
    }

    fn from_proto(f: &proto::ChainFile) -> Self {
        let mode = proto::chain_file::Mode::from_i32(f.mode).unwrap_or(proto::chain_file::Mode::Append);
        Self { path: f.path.clone(), mode: mode.into() }
    }
}

/// A point-in-time snapshot of a channel's declared state (`SelfChannelInfo`,
/// spec.md §4.6).
#[derive(Clone, Debug)]
pub struct ChannelInfo {
    /// The channel name.
    pub chain_id: String,
    /// The fixed leader (leadership never changes post-creation, §9(a)).
    pub leader: PkiId,
    /// Current member set.
    pub members: HashSet<PkiId>,
    /// Current file manifest, in declaration order.
    pub files: Vec<ChannelFile>,
    /// The state's version.
    pub seq_num: u64,
}

/// Whether this node created the channel (and is therefore the only peer
/// allowed to mutate it) or joined as a follower.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelRole {
    /// This node is the fixed leader.
    Leader,
    /// This node follows the channel's leader.
    Follower,
}

struct ChannelInner {
    members: HashSet<PkiId>,
    files: Vec<ChannelFile>,
    seq_num: u64,
    /// The most recently adopted/published signed state, for responding to
    /// pull requests and re-publication.
    current: Option<ChainState>,
}

/// One channel's state machine: `absent → joined-follower | joined-leader`
/// (spec.md §4.6's state machine; `absent` is simply "no `Channel` exists in
/// the registry").
pub struct Channel {
    chain_id: String,
    chain_mac: RwLock<Vec<u8>>,
    self_pki_id: PkiId,
    leader: RwLock<Option<PkiId>>,
    role: ChannelRole,
    identity: Arc<IdentityMapper>,
    publisher: Arc<dyn Publisher>,
    peers: Arc<dyn PeerSelector>,
    fs: Arc<dyn FileSystemAdapter>,
    data_sync: Arc<dyn DataSyncHandler>,
    config: GossipConfig,
    inner: RwLock<ChannelInner>,
    shutdown: Notify,
}

impl Channel {
    /// Create a channel with this node as its fixed leader
    /// (`Initialize(members, files)`, spec.md §4.6). `members` should
    /// include `self_pki_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_leader(
        chain_id: impl Into<String>,
        members: Vec<PkiId>,
        files: Vec<ChannelFile>,
        identity: Arc<IdentityMapper>,
        publisher: Arc<dyn Publisher>,
        peers: Arc<dyn PeerSelector>,
        fs: Arc<dyn FileSystemAdapter>,
        data_sync: Arc<dyn DataSyncHandler>,
        config: GossipConfig,
    ) -> GossipResult<Arc<Self>> {
        let chain_id = chain_id.into();
        let self_pki_id = identity.self_pki_id();
        let chain_mac = message::chain_mac(self_pki_id, &chain_id);

        let channel = Arc::new(Self {
            chain_id: chain_id.clone(),
            chain_mac: RwLock::new(chain_mac),
            self_pki_id,
            leader: RwLock::new(Some(self_pki_id)),
            role: ChannelRole::Leader,
            identity,
            publisher,
            peers,
            fs,
            data_sync,
            config,
            inner: RwLock::new(ChannelInner {
                members: members.into_iter().collect(),
                files,
                seq_num: 0,
                current: None,
            }),
            shutdown: Notify::new(),
        });

        channel.publish_new_state()?;
        Ok(channel)
    }

    /// Create a placeholder for a channel this node follows. The channel
    /// starts with `seqNum = 0` (unadopted); its first `ChainState` arrives
    /// through [`Channel::adopt_chain_state`].
    pub fn join_follower(
        chain_id: impl Into<String>,
        leader: Option<PkiId>,
        self_pki_id: PkiId,
        identity: Arc<IdentityMapper>,
        publisher: Arc<dyn Publisher>,
        peers: Arc<dyn PeerSelector>,
        fs: Arc<dyn FileSystemAdapter>,
        data_sync: Arc<dyn DataSyncHandler>,
        config: GossipConfig,
    ) -> Arc<Self> {
        let chain_id = chain_id.into();
        // A follower may not yet know the leader's pki-id (it is learning
        // the channel's existence from a ChainState message's chainMac
        // alone); in that case the mac is validated lazily on adoption
        // against whatever leader the first ChainState declares.
        let chain_mac = leader
            .map(|l| message::chain_mac(l, &chain_id))
            .unwrap_or_default();

        Arc::new(Self {
            chain_id,
            chain_mac: RwLock::new(chain_mac),
            self_pki_id,
            leader: RwLock::new(leader),
            role: ChannelRole::Follower,
            identity,
            publisher,
            peers,
            fs,
            data_sync,
            config,
            inner: RwLock::new(ChannelInner {
                members: HashSet::new(),
                files: Vec::new(),
                seq_num: 0,
                current: None,
            }),
            shutdown: Notify::new(),
        })
    }

    /// The channel name.
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// The chainMac this channel validates incoming state against. Empty
    /// until a follower learns its leader.
    pub fn chain_mac(&self) -> Vec<u8> {
        self.chain_mac.read().unwrap().clone()
    }

    /// Whether this node is the channel's leader.
    pub fn is_leader(&self) -> bool {
        self.role == ChannelRole::Leader
    }

    /// `SelfChannelInfo`: a snapshot of the channel's current declared
    /// state.
    pub fn self_channel_info(&self) -> ChannelInfo {
        let inner = self.inner.read().unwrap();
        ChannelInfo {
            chain_id: self.chain_id.clone(),
            leader: self.leader.read().unwrap().unwrap_or(self.self_pki_id),
            members: inner.members.clone(),
            files: inner.files.clone(),
            seq_num: inner.seq_num,
        }
    }

    /// Add a member to the channel (leader only). Returns the new
    /// `ChainState` for the caller to persist/inspect.
    pub fn add_member(&self, pki_id: PkiId) -> GossipResult<ChainState> {
        self.mutate(|inner| {
            inner.members.insert(pki_id);
        })
    }

    /// Add a file manifest entry (leader only).
    pub fn add_file(&self, file: ChannelFile) -> GossipResult<ChainState> {
        self.fs.create(&file.path).map_err(|e| GossipError::InvalidInput(format!("fs create failed: {e}")))?;
        self.mutate(|inner| {
            inner.files.push(file);
        })
    }

    fn mutate(&self, edit: impl FnOnce(&mut ChannelInner)) -> GossipResult<ChainState> {
        if self.role != ChannelRole::Leader {
            return Err(GossipError::NotLeader);
        }
        {
            let mut inner = self.inner.write().unwrap();
            edit(&mut inner);
            inner.seq_num += 1;
        }
        self.publish_new_state()
    }

    fn publish_new_state(&self) -> GossipResult<ChainState> {
        let (info, seq_num, members) = {
            let inner = self.inner.read().unwrap();
            let info = ChainStateInfo {
                leader: self.self_pki_id.as_bytes().to_vec(),
                members: inner.members.iter().map(|m| m.as_bytes().to_vec()).collect(),
                files: inner.files.iter().map(ChannelFile::to_proto).collect(),
            };
            (info, inner.seq_num, inner.members.clone())
        };

        let chain_mac = self.chain_mac();
        let payload = info.encode_to_vec();
        let signature = self.identity.sign(&payload).to_bytes().to_vec();
        let state = ChainState {
            chain_id: self.chain_id.clone(),
            chain_mac: chain_mac.clone(),
            seq_num,
            payload,
            signature,
        };

        {
            let mut inner = self.inner.write().unwrap();
            inner.current = Some(state.clone());
        }

        let envelope = self.wrap_and_sign(Content::ChainState(state.clone()));
        self.publisher.publish(EmittedMessage::to_members(
            envelope,
            chain_mac,
            members.into_iter().collect(),
            self.config.propagate_iterations,
        ));

        Ok(state)
    }

    fn wrap_and_sign(&self, content: Content) -> proto::Envelope {
        let inner = proto::RkSyncMessage {
            nonce: 0,
            channel: self.chain_mac(),
            tag: Tag::ChanOnly as i32,
            content: Some(content),
        };
        message::sign_with_identity(&self.identity, inner)
    }

    /// Adopt an inbound `ChainState` (`InitializeWithChainState` for a
    /// first-time follower, or routine reconciliation thereafter). Verifies
    /// the chainMac, the leader's signature over the payload, and that self
    /// is a declared member; rejects a stale (lower-or-equal) seqNum.
    pub fn adopt_chain_state(&self, state: ChainState) -> GossipResult<bool> {
        if self.role == ChannelRole::Leader {
            // The leader is the sole author of its own state; never adopts.
            return Ok(false);
        }
        let known_mac = self.chain_mac();
        if state.chain_mac != known_mac && !known_mac.is_empty() {
            return Err(GossipError::InvalidInput("chainMac mismatch".into()));
        }

        let info = ChainStateInfo::decode(state.payload.as_slice())
            .map_err(|e| GossipError::InvalidInput(format!("malformed ChainStateInfo: {e}")))?;
        let leader = pki_from_bytes(&info.leader)
            .ok_or_else(|| GossipError::InvalidInput("ChainStateInfo has no leader".into()))?;

        let expected_mac = message::chain_mac(leader, &self.chain_id);
        if expected_mac != state.chain_mac {
            return Err(GossipError::InvalidInput(
                "chainMac does not match SHA256(leader || chainId)".into(),
            ));
        }

        let signature = crate::message::parse_signature(&state.signature).ok_or(GossipError::SignatureInvalid)?;
        self.identity.verify(leader, &signature, &state.payload)?;

        let members: HashSet<PkiId> = info.members.iter().filter_map(|b| pki_from_bytes(b)).collect();
        if !members.contains(&self.self_pki_id) {
            return Err(GossipError::InvalidInput("self is not a member of the declared channel state".into()));
        }

        let accepted = {
            let mut inner = self.inner.write().unwrap();
            if state.seq_num <= inner.seq_num && inner.current.is_some() {
                false
            } else {
                inner.members = members;
                inner.files = info.files.iter().map(ChannelFile::from_proto).collect();
                inner.seq_num = state.seq_num;
                inner.current = Some(state);
                true
            }
        };

        if accepted {
            *self.leader.write().unwrap() = Some(leader);
            if known_mac.is_empty() {
                *self.chain_mac.write().unwrap() = expected_mac;
                warn!(chain_id = %self.chain_id, "adopted chain state without a pre-known leader; chainMac learned lazily");
            }
            debug!(chain_id = %self.chain_id, %leader, "adopted chain state");
        }
        Ok(accepted)
    }

    /// The current signed state, for responding to a `ChainStatePullRequest`
    /// (`None` for a follower that hasn't adopted anything yet).
    pub fn current_state(&self) -> Option<ChainState> {
        self.inner.read().unwrap().current.clone()
    }

    /// Deliver a channel-restricted data-sync payload to the injected
    /// handler.
    pub fn handle_data_sync(&self, from: PkiId, payload: &[u8]) -> GossipResult<()> {
        self.data_sync.handle(&self.chain_id, from, payload)
    }

    fn pull_targets(&self) -> Vec<PkiId> {
        let members: HashSet<PkiId> = self.inner.read().unwrap().members.clone();
        let candidates: Vec<NetworkMember> = self
            .peers
            .alive_members()
            .into_iter()
            .filter(|m| m.pki_id != self.self_pki_id && members.contains(&m.pki_id))
            .collect();
        select_peers(self.config.pull_peer_num, &candidates, |_| true)
            .into_iter()
            .map(|m| m.pki_id)
            .collect()
    }

    /// Send `ChainStatePullRequest{chainMac}` to `pullPeerNum` random alive
    /// members (spec.md §4.6's pull reconciliation).
    pub fn emit_pull_request(&self) {
        let chain_mac = self.chain_mac();
        if chain_mac.is_empty() {
            return;
        }
        let targets = self.pull_targets();
        if targets.is_empty() {
            return;
        }
        let request = proto::ChainStatePullRequest { chain_mac };
        let envelope = self.wrap_and_sign(Content::ChainStatePullReq(request));
        self.publisher.publish(EmittedMessage::to_peers(envelope, targets, 1));
    }

    /// Spawn the per-channel pull loop, staggered by the caller (each
    /// channel's task starts its own independent interval timer, so a large
    /// member set doesn't synchronize every channel's pulls to the same
    /// tick).
    pub fn spawn_pull_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_pull_loop().await })
    }

    async fn run_pull_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.pull_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.emit_pull_request(),
                _ = self.shutdown.notified() => break,
            }
        }
    }

    /// Stop this channel's pull loop.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

/// A registry of channels keyed by chainId, with a secondary index by
/// chainMac for message routing (spec.md §4.6's `lookupChannelForMsg`).
#[derive(Default)]
pub struct ChannelRegistry {
    by_chain_id: RwLock<HashMap<String, Arc<Channel>>>,
    by_mac: RwLock<HashMap<Vec<u8>, Arc<Channel>>>,
}

impl ChannelRegistry {
    /// Build an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, channel: Arc<Channel>) -> Arc<Channel> {
        self.by_chain_id.write().unwrap().insert(channel.chain_id.clone(), channel.clone());
        let chain_mac = channel.chain_mac();
        if !chain_mac.is_empty() {
            self.by_mac.write().unwrap().insert(chain_mac, channel.clone());
        }
        channel
    }

    /// `joinChannel(chainId, asLeader: true)`: idempotent. Returns the
    /// existing channel if already created.
    #[allow(clippy::too_many_arguments)]
    pub fn join_as_leader(
        &self,
        chain_id: impl Into<String>,
        members: Vec<PkiId>,
        files: Vec<ChannelFile>,
        identity: Arc<IdentityMapper>,
        publisher: Arc<dyn Publisher>,
        peers: Arc<dyn PeerSelector>,
        fs: Arc<dyn FileSystemAdapter>,
        data_sync: Arc<dyn DataSyncHandler>,
        config: GossipConfig,
    ) -> GossipResult<Arc<Channel>> {
        let chain_id = chain_id.into();
        if let Some(existing) = self.by_chain_id.read().unwrap().get(&chain_id) {
            return Ok(existing.clone());
        }
        let channel = Channel::create_leader(chain_id, members, files, identity, publisher, peers, fs, data_sync, config)?;
        Ok(self.index(channel))
    }

    /// `joinChannel(chainId, asLeader: false)`: idempotent. `leader` is the
    /// leader's pki-id if already known (e.g. learned out of band);
    /// otherwise left unvalidated until the first `ChainState` arrives.
    #[allow(clippy::too_many_arguments)]
    pub fn join_as_follower(
        &self,
        chain_id: impl Into<String>,
        leader: Option<PkiId>,
        self_pki_id: PkiId,
        identity: Arc<IdentityMapper>,
        publisher: Arc<dyn Publisher>,
        peers: Arc<dyn PeerSelector>,
        fs: Arc<dyn FileSystemAdapter>,
        data_sync: Arc<dyn DataSyncHandler>,
        config: GossipConfig,
    ) -> Arc<Channel> {
        let chain_id = chain_id.into();
        if let Some(existing) = self.by_chain_id.read().unwrap().get(&chain_id) {
            return existing.clone();
        }
        let channel = Channel::join_follower(chain_id, leader, self_pki_id, identity, publisher, peers, fs, data_sync, config);
        self.index(channel)
    }

    /// `lookupChannelForMsg`: resolve by the chainMac carried in a message
    /// envelope.
    pub fn resolve_by_mac(&self, chain_mac: &[u8]) -> Option<Arc<Channel>> {
        self.by_mac.read().unwrap().get(chain_mac).cloned()
    }

    /// Resolve by channel name.
    pub fn resolve_by_chain_id(&self, chain_id: &str) -> Option<Arc<Channel>> {
        self.by_chain_id.read().unwrap().get(chain_id).cloned()
    }

    /// Register (or re-register) a follower channel's mac index once its
    /// leader becomes known, e.g. right after the first successful
    /// [`Channel::adopt_chain_state`] call using a chainMac learned lazily.
    pub fn reindex_mac(&self, channel: &Arc<Channel>) {
        let chain_mac = channel.chain_mac();
        if !chain_mac.is_empty() {
            self.by_mac.write().unwrap().insert(chain_mac, channel.clone());
        }
    }

    /// `CloseChannel`: `joined-follower → absent`. Removes both indices.
    pub fn close_channel(&self, chain_id: &str) {
        if let Some(channel) = self.by_chain_id.write().unwrap().remove(chain_id) {
            channel.stop();
            self.by_mac.write().unwrap().remove(&channel.chain_mac());
        }
    }

    /// Every currently joined channel, for spawning pull loops at startup.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.by_chain_id.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datasync::NoopDataSyncHandler, fs::LocalFileSystemAdapter};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use rksync_common::{PeerIdentity, SigningIdentity};
    use std::sync::Mutex;

    struct RecordingPublisher {
        published: Mutex<Vec<EmittedMessage>>,
    }

    impl RecordingPublisher {
        fn new() -> Arc<Self> {
            Arc::new(Self { published: Mutex::new(Vec::new()) })
        }
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, message: EmittedMessage) {
            self.published.lock().unwrap().push(message);
        }
    }

    struct AllAlive(Vec<NetworkMember>);

    impl PeerSelector for AllAlive {
        fn alive_members(&self) -> Vec<NetworkMember> {
            self.0.clone()
        }
        fn is_alive(&self, pki_id: PkiId) -> bool {
            self.0.iter().any(|m| m.pki_id == pki_id)
        }
    }

    fn identity_for(node_id: &str) -> Arc<IdentityMapper> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let identity = PeerIdentity::new(node_id, signing_key.verifying_key().to_bytes().to_vec());
        Arc::new(IdentityMapper::new(SigningIdentity::new(signing_key, identity)))
    }

    fn temp_fs(tag: &str) -> Arc<LocalFileSystemAdapter> {
        Arc::new(LocalFileSystemAdapter::new(
            std::env::temp_dir().join(format!("rksync-channel-test-{tag}-{}", std::process::id())),
        ))
    }

    #[test]
    fn leader_initialize_publishes_seq_one() {
        let identity = identity_for("leader:9000");
        let self_pki_id = identity.self_pki_id();
        let publisher = RecordingPublisher::new();
        let peers = Arc::new(AllAlive(vec![]));

        let channel = Channel::create_leader(
            "c1",
            vec![self_pki_id],
            vec![ChannelFile::new("f", ChannelFileMode::Append)],
            identity,
            publisher.clone(),
            peers,
            temp_fs("leader-init"),
            Arc::new(NoopDataSyncHandler),
            GossipConfig::default(),
        )
        .unwrap();

        let info = channel.self_channel_info();
        assert_eq!(info.seq_num, 1);
        assert_eq!(info.leader, self_pki_id);
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[test]
    fn follower_cannot_mutate() {
        let leader_identity = identity_for("leader:9000");
        let leader_pki_id = leader_identity.self_pki_id();
        let follower_identity = identity_for("follower:9001");
        let publisher = RecordingPublisher::new();
        let peers = Arc::new(AllAlive(vec![]));

        let follower = Channel::join_follower(
            "c1",
            Some(leader_pki_id),
            follower_identity.self_pki_id(),
            follower_identity,
            publisher,
            peers,
            temp_fs("follower-mutate"),
            Arc::new(NoopDataSyncHandler),
            GossipConfig::default(),
        );

        assert!(matches!(follower.add_member(PkiId([9; 32])), Err(GossipError::NotLeader)));
    }

    #[test]
    fn follower_adopts_valid_chain_state() {
        let leader_identity = identity_for("leader:9000");
        let leader_pki_id = leader_identity.self_pki_id();
        let leader_peer_identity = leader_identity.self_identity().clone();
        let follower_identity = identity_for("follower:9001");
        let follower_pki_id = follower_identity.self_pki_id();
        follower_identity.put(leader_pki_id, leader_peer_identity).unwrap();

        let leader_peers = Arc::new(AllAlive(vec![]));
        let leader_publisher = RecordingPublisher::new();
        let leader = Channel::create_leader(
            "c1",
            vec![leader_pki_id, follower_pki_id],
            vec![],
            leader_identity,
            leader_publisher,
            leader_peers,
            temp_fs("leader-adopt"),
            Arc::new(NoopDataSyncHandler),
            GossipConfig::default(),
        )
        .unwrap();
        let state = leader.current_state().unwrap();

        let follower_publisher = RecordingPublisher::new();
        let follower_peers = Arc::new(AllAlive(vec![]));
        let follower = Channel::join_follower(
            "c1",
            Some(leader_pki_id),
            follower_pki_id,
            follower_identity,
            follower_publisher,
            follower_peers,
            temp_fs("follower-adopt"),
            Arc::new(NoopDataSyncHandler),
            GossipConfig::default(),
        );

        assert!(follower.adopt_chain_state(state).unwrap());
        let info = follower.self_channel_info();
        assert_eq!(info.seq_num, 1);
        assert!(info.members.contains(&follower_pki_id));
    }

    #[test]
    fn adopt_rejects_mac_mismatch() {
        let leader_identity = identity_for("leader:9000");
        let leader_pki_id = leader_identity.self_pki_id();
        let other_leader_identity = identity_for("other-leader:9002");

        let leader = Channel::create_leader(
            "c1",
            vec![leader_pki_id],
            vec![],
            leader_identity,
            RecordingPublisher::new(),
            Arc::new(AllAlive(vec![])),
            temp_fs("mac-mismatch-leader"),
            Arc::new(NoopDataSyncHandler),
            GossipConfig::default(),
        )
        .unwrap();
        let state = leader.current_state().unwrap();

        // Declares a different leader's pki-id via its pre-known mac, so
        // the mac doesn't match the state's recomputed SHA256(leader||c1).
        let wrong_leader_pki_id = other_leader_identity.self_pki_id();
        let follower = Channel::join_follower(
            "c1",
            Some(wrong_leader_pki_id),
            PkiId([4; 32]),
            other_leader_identity,
            RecordingPublisher::new(),
            Arc::new(AllAlive(vec![])),
            temp_fs("mac-mismatch-follower"),
            Arc::new(NoopDataSyncHandler),
            GossipConfig::default(),
        );

        assert!(matches!(follower.adopt_chain_state(state), Err(GossipError::InvalidInput(_))));
    }

    #[test]
    fn adopt_rejects_non_member() {
        let leader_identity = identity_for("leader:9000");
        let leader_pki_id = leader_identity.self_pki_id();
        let leader_peer_identity = leader_identity.self_identity().clone();
        let outsider_identity = identity_for("outsider:9003");
        let outsider_pki_id = outsider_identity.self_pki_id();
        outsider_identity.put(leader_pki_id, leader_peer_identity).unwrap();

        let leader = Channel::create_leader(
            "c1",
            vec![leader_pki_id],
            vec![],
            leader_identity,
            RecordingPublisher::new(),
            Arc::new(AllAlive(vec![])),
            temp_fs("non-member-leader"),
            Arc::new(NoopDataSyncHandler),
            GossipConfig::default(),
        )
        .unwrap();
        let state = leader.current_state().unwrap();

        let outsider = Channel::join_follower(
            "c1",
            Some(leader_pki_id),
            outsider_pki_id,
            outsider_identity,
            RecordingPublisher::new(),
            Arc::new(AllAlive(vec![])),
            temp_fs("non-member-follower"),
            Arc::new(NoopDataSyncHandler),
            GossipConfig::default(),
        );

        assert!(matches!(outsider.adopt_chain_state(state), Err(GossipError::InvalidInput(_))));
    }

    #[test]
    fn stale_seq_num_is_rejected() {
        let leader_identity = identity_for("leader:9000");
        let leader_pki_id = leader_identity.self_pki_id();
        let leader_peer_identity = leader_identity.self_identity().clone();
        let follower_identity = identity_for("follower:9001");
        let follower_pki_id = follower_identity.self_pki_id();
        follower_identity.put(leader_pki_id, leader_peer_identity).unwrap();

        let leader = Channel::create_leader(
            "c1",
            vec![leader_pki_id, follower_pki_id],
            vec![],
            leader_identity,
            RecordingPublisher::new(),
            Arc::new(AllAlive(vec![])),
            temp_fs("stale-leader"),
            Arc::new(NoopDataSyncHandler),
            GossipConfig::default(),
        )
        .unwrap();
        let first_state = leader.current_state().unwrap();
        leader.add_member(PkiId([8; 32])).unwrap();
        let second_state = leader.current_state().unwrap();

        let follower = Channel::join_follower(
            "c1",
            Some(leader_pki_id),
            follower_pki_id,
            follower_identity,
            RecordingPublisher::new(),
            Arc::new(AllAlive(vec![])),
            temp_fs("stale-follower"),
            Arc::new(NoopDataSyncHandler),
            GossipConfig::default(),
        );

        assert!(follower.adopt_chain_state(second_state).unwrap());
        assert!(!follower.adopt_chain_state(first_state).unwrap());
    }

    #[test]
    fn registry_join_is_idempotent() {
        let identity = identity_for("leader:9000");
        let self_pki_id = identity.self_pki_id();
        let registry = ChannelRegistry::new();

        let first = registry
            .join_as_leader(
                "c1",
                vec![self_pki_id],
                vec![],
                identity.clone(),
                RecordingPublisher::new(),
                Arc::new(AllAlive(vec![])),
                temp_fs("registry-idempotent"),
                Arc::new(NoopDataSyncHandler),
                GossipConfig::default(),
            )
            .unwrap();
        let second = registry
            .join_as_leader(
                "c1",
                vec![self_pki_id],
                vec![],
                identity,
                RecordingPublisher::new(),
                Arc::new(AllAlive(vec![])),
                temp_fs("registry-idempotent-2"),
                Arc::new(NoopDataSyncHandler),
                GossipConfig::default(),
            )
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn registry_resolves_by_mac() {
        let identity = identity_for("leader:9000");
        let self_pki_id = identity.self_pki_id();
        let registry = ChannelRegistry::new();
        let channel = registry
            .join_as_leader(
                "c1",
                vec![self_pki_id],
                vec![],
                identity,
                RecordingPublisher::new(),
                Arc::new(AllAlive(vec![])),
                temp_fs("registry-mac"),
                Arc::new(NoopDataSyncHandler),
                GossipConfig::default(),
            )
            .unwrap();

        let resolved = registry.resolve_by_mac(&channel.chain_mac()).unwrap();
        assert!(Arc::ptr_eq(&resolved, &channel));
    }
}
