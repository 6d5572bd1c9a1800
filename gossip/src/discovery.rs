// Copyright (c) 2018-2022 The Botho Foundation

//! Discovery (L5): the peer table (`aliveSet`/`deadSet`/last-seen), periodic
//! alive emission, alive-timestamp reconciliation, aliveness expiry, and
//! membership request/response anti-entropy (spec.md §4.5).

pub mod policy;

use crate::{
    config::GossipConfig,
    error::{GossipError, GossipResult},
    identity::{decode_identity, encode_identity, IdentityMapper},
    message::{self, pki_from_bytes},
    store::{Comparison, MessageComparator, MessageStore},
    types::{select_peers, NetworkMember, PeerSelector, Publisher},
};
use policy::DisclosurePolicy;

use rksync_common::{PeerTime, PkiId};
use rksync_transport::proto::{self, r_k_sync_message::Content, r_k_sync_message::Tag, AliveMessage, RkSyncMessage};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Instant,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, trace, warn};

/// Groups stored alive messages by sender pki-id and keeps only the one with
/// the highest [`PeerTime`] (spec.md §4.2's "alive-message dedup per peer").
struct AliveComparator;

impl MessageComparator<AliveMessage> for AliveComparator {
    fn compare(&self, incoming: &AliveMessage, existing: &AliveMessage) -> Comparison {
        let incoming_id = incoming.membership.as_ref().and_then(|m| pki_from_bytes(&m.pki_id));
        let existing_id = existing.membership.as_ref().and_then(|m| pki_from_bytes(&m.pki_id));
        if incoming_id != existing_id {
            return Comparison::Distinct;
        }
        let incoming_time = incoming.timestamp.as_ref().map(message::peer_time_from_proto).unwrap_or_default();
        let existing_time = existing.timestamp.as_ref().map(message::peer_time_from_proto).unwrap_or_default();
        if incoming_time == existing_time {
            Comparison::Equal
        } else if incoming_time > existing_time {
            Comparison::Supersedes
        } else {
            Comparison::Stale
        }
    }
}

#[derive(Default)]
struct PeerTable {
    alive: HashMap<PkiId, NetworkMember>,
    dead: HashMap<PkiId, NetworkMember>,
    last_timestamp: HashMap<PkiId, PeerTime>,
    last_seen: HashMap<PkiId, Instant>,
}

/// The Discovery component. Owns the peer table and the alive-message dedup
/// store; publishes through the injected [`Publisher`] rather than holding a
/// back-reference to the emitter or the service (spec.md §9).
pub struct Discovery {
    self_pki_id: PkiId,
    self_endpoint: String,
    inc_num: u64,
    seq_num: AtomicU64,
    started_at: Instant,
    config: GossipConfig,
    identity: Arc<IdentityMapper>,
    publisher: Arc<dyn Publisher>,
    policy: Box<dyn DisclosurePolicy>,
    table: RwLock<PeerTable>,
    alive_store: MessageStore<AliveMessage, AliveComparator>,
    shutdown: Notify,
    stopped: AtomicBool,
}

impl Discovery {
    /// Build a Discovery instance. `inc_num` is the node's boot epoch,
    /// supplied by the embedder (monotonic across restarts, spec.md §3).
    pub fn new(
        config: GossipConfig,
        inc_num: u64,
        identity: Arc<IdentityMapper>,
        publisher: Arc<dyn Publisher>,
        policy: Box<dyn DisclosurePolicy>,
    ) -> Arc<Self> {
        let self_pki_id = identity.self_pki_id();
        let self_endpoint = config.endpoint.clone();
        Arc::new(Self {
            self_pki_id,
            self_endpoint,
            inc_num,
            seq_num: AtomicU64::new(0),
            started_at: Instant::now(),
            config,
            identity,
            publisher,
            policy,
            table: RwLock::new(PeerTable::default()),
            alive_store: MessageStore::new(AliveComparator),
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// This node's own record, always reported alive.
    pub fn self_member(&self) -> NetworkMember {
        NetworkMember::new(self.self_endpoint.clone(), self.self_pki_id, Vec::new())
    }

    /// Every known pki-id, alive or dead — the `known[]` field of an
    /// outbound `MembershipRequest`.
    pub fn known_pki_ids(&self) -> Vec<PkiId> {
        let table = self.table.read().unwrap();
        table.alive.keys().chain(table.dead.keys()).copied().collect()
    }

    /// Whether we're still inside the post-startup identity warm-up window
    /// (spec.md §4.5: "Identity is included only while `now <
    /// includeIdentityPeriod`").
    fn within_identity_warmup(&self) -> bool {
        self.started_at.elapsed() < self.config.include_identity_period()
    }

    fn build_alive_proto(&self) -> AliveMessage {
        let seq_num = self.seq_num.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp = message::peer_time_to_proto(PeerTime::new(self.inc_num, seq_num));
        let identity = if self.within_identity_warmup() {
            encode_identity(self.identity.self_identity())
        } else {
            Vec::new()
        };
        AliveMessage {
            membership: Some(self.self_member().to_proto()),
            timestamp: Some(timestamp),
            identity,
        }
    }

    fn sign_and_wrap(&self, content: Content) -> proto::Envelope {
        let inner = RkSyncMessage {
            nonce: 0,
            channel: Vec::new(),
            tag: Tag::Empty as i32,
            content: Some(content),
        };
        message::sign_with_identity(&self.identity, inner)
    }

    /// Construct and publish a fresh `AliveMessage`, filter = all peers
    /// (spec.md §4.5's periodic alive emission).
    pub fn emit_alive(&self) {
        let alive = self.build_alive_proto();
        let envelope = self.sign_and_wrap(Content::AliveMsg(alive));
        self.publisher
            .publish(crate::emitter::EmittedMessage::broadcast(envelope, self.config.propagate_iterations));
    }

    /// Alive-timestamp reconciliation on an inbound alive message
    /// (spec.md §4.5, steps 1-3; signature verification is the caller's
    /// responsibility — see [`crate::service::GossipService::handle_message`]).
    /// Returns whether the message was accepted (not stale).
    pub fn handle_alive(&self, msg: AliveMessage, from: PkiId) -> GossipResult<bool> {
        let member = msg
            .membership
            .as_ref()
            .and_then(NetworkMember::from_proto)
            .ok_or_else(|| GossipError::InvalidInput("alive message has no membership".into()))?;
        if member.pki_id != from {
            return Err(GossipError::InvalidInput(
                "alive message pki-id does not match sender".into(),
            ));
        }
        let incoming_time = msg.timestamp.as_ref().map(message::peer_time_from_proto).unwrap_or_default();

        let was_known = {
            let table = self.table.read().unwrap();
            table.alive.contains_key(&from) || table.dead.contains_key(&from)
        };

        let accepted = {
            let mut table = self.table.write().unwrap();
            match table.last_timestamp.get(&from) {
                Some(stored) if *stored >= incoming_time => false,
                _ => {
                    table.last_timestamp.insert(from, incoming_time);
                    table.last_seen.insert(from, Instant::now());
                    table.dead.remove(&from);
                    table.alive.insert(from, member.clone());
                    true
                }
            }
        };

        if !accepted {
            trace!(%from, "discarding stale alive message");
            return Ok(false);
        }

        if let Some(identity_bytes) = Some(&msg.identity).filter(|b| !b.is_empty()) {
            if let Some(identity) = decode_identity(identity_bytes) {
                if let Err(e) = self.identity.put(from, identity) {
                    warn!(%from, error = %e, "failed to bind identity from alive message");
                }
            }
        }

        self.alive_store.add(msg, None);

        if !was_known {
            debug!(%from, "discovered new peer, requesting membership");
            self.send_membership_request(&[from]);
        }

        Ok(true)
    }

    fn send_membership_request(&self, targets: &[PkiId]) {
        let request = self.build_membership_request();
        let envelope = self.sign_and_wrap(Content::MemReq(request));
        self.publisher
            .publish(crate::emitter::EmittedMessage::to_peers(envelope, targets.to_vec(), 1));
    }

    /// Build a `MembershipRequest` carrying our current self-info and known
    /// set (spec.md §4.5's sync loop).
    pub fn build_membership_request(&self) -> proto::MembershipRequest {
        proto::MembershipRequest {
            self_information: Some(self.build_alive_proto()),
            known: self.known_pki_ids().iter().map(|id| id.as_bytes().to_vec()).collect(),
        }
    }

    /// Handle an inbound `MembershipRequest`, already validated by the
    /// service (self-info pki-id matched the transport handshake pki-id).
    /// Applies the disclosure policy before including each alive peer.
    pub fn handle_membership_request(&self, req: proto::MembershipRequest) -> proto::MembershipResponse {
        let known: HashSet<PkiId> = req.known.iter().filter_map(|b| pki_from_bytes(b)).collect();
        let requester = req
            .self_information
            .as_ref()
            .and_then(|a| a.membership.as_ref())
            .and_then(NetworkMember::from_proto)
            .unwrap_or_else(|| NetworkMember::dead(PkiId([0; 32])));

        let alive_entries = self.alive_store.snapshot();
        let mut alive = Vec::new();
        for entry in alive_entries {
            let Some(pki_id) = entry.membership.as_ref().and_then(|m| pki_from_bytes(&m.pki_id)) else {
                continue;
            };
            if known.contains(&pki_id) {
                continue;
            }
            if self.policy.sieve(&entry, &requester) {
                alive.push(self.policy.envelope_filter(&entry));
            }
        }

        let table = self.table.read().unwrap();
        let dead = table
            .dead
            .iter()
            .filter(|(pki_id, _)| !known.contains(pki_id))
            .map(|(_, member)| member.to_proto())
            .collect();

        proto::MembershipResponse { alive, dead }
    }

    /// Merge the peers disclosed in a `MembershipResponse` into our table.
    pub fn handle_membership_response(&self, res: proto::MembershipResponse) {
        for alive in res.alive {
            let Some(member) = alive.membership.as_ref().and_then(NetworkMember::from_proto) else {
                continue;
            };
            let incoming_time = alive.timestamp.as_ref().map(message::peer_time_from_proto).unwrap_or_default();
            let mut table = self.table.write().unwrap();
            let should_update = !matches!(table.last_timestamp.get(&member.pki_id), Some(stored) if *stored >= incoming_time);
            if should_update {
                table.last_timestamp.insert(member.pki_id, incoming_time);
                table.last_seen.insert(member.pki_id, Instant::now());
                table.dead.remove(&member.pki_id);
                table.alive.insert(member.pki_id, member);
            }
        }
        let mut table = self.table.write().unwrap();
        for dead in res.dead {
            if let Some(member) = NetworkMember::from_proto(&dead) {
                if !table.alive.contains_key(&member.pki_id) {
                    table.dead.insert(member.pki_id, member);
                }
            }
        }
    }

    /// Directly register a peer learned out-of-band (e.g. a successful
    /// bootstrap handshake), without going through the alive-message path.
    pub fn note_peer(&self, member: NetworkMember) {
        let mut table = self.table.write().unwrap();
        table.last_seen.insert(member.pki_id, Instant::now());
        table.dead.remove(&member.pki_id);
        table.alive.insert(member.pki_id, member);
    }

    /// Move a peer straight to the dead set in response to a transport-level
    /// `PresumedDead` signal (spec.md §4.7's `handlePresumedDead` loop),
    /// bypassing the usual timeout.
    pub fn mark_presumed_dead(&self, pki_id: PkiId) {
        let mut table = self.table.write().unwrap();
        if let Some(member) = table.alive.remove(&pki_id) {
            table.dead.insert(pki_id, NetworkMember::dead(member.pki_id));
            debug!(%pki_id, "peer presumed dead");
        }
    }

    /// Aliveness expiry sweep (spec.md §4.5): peers unseen for
    /// `aliveExpirationTimeout` move alive → dead; peers unseen for
    /// `aliveExpirationTimeout × msgExpirationFactor` are evicted outright,
    /// along with their stored alive message.
    pub fn sweep(&self, now: Instant) {
        let expiration = self.config.alive_expiration_timeout();
        let eviction = self.config.eviction_timeout();

        let mut to_dead = Vec::new();
        let mut to_evict = Vec::new();
        {
            let table = self.table.read().unwrap();
            for (pki_id, last_seen) in table.last_seen.iter() {
                let idle = now.saturating_duration_since(*last_seen);
                if idle > eviction {
                    to_evict.push(*pki_id);
                } else if idle > expiration && table.alive.contains_key(pki_id) {
                    to_dead.push(*pki_id);
                }
            }
        }

        if !to_dead.is_empty() || !to_evict.is_empty() {
            let mut table = self.table.write().unwrap();
            for pki_id in &to_dead {
                if let Some(member) = table.alive.remove(pki_id) {
                    table.dead.insert(*pki_id, NetworkMember::dead(member.pki_id));
                }
            }
            for pki_id in &to_evict {
                table.alive.remove(pki_id);
                table.dead.remove(pki_id);
                table.last_seen.remove(pki_id);
                table.last_timestamp.remove(pki_id);
            }
        }

        for pki_id in &to_evict {
            let evicted = *pki_id;
            self.alive_store
                .remove_where(|m| m.membership.as_ref().and_then(|mem| pki_from_bytes(&mem.pki_id)) == Some(evicted));
            debug!(%evicted, "evicted peer and purged its alive message");
        }
    }

    /// Spawn the task driving periodic alive emission and the aliveness
    /// sweep, both on `aliveTimeInterval` (spec.md §4.5). Mirrors
    /// [`crate::emitter::Emitter::spawn`]'s single-timer-task pattern.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.alive_time_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.emit_alive();
                    self.sweep(Instant::now());
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    /// Stop the discovery task.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl PeerSelector for Discovery {
    fn alive_members(&self) -> Vec<NetworkMember> {
        let table = self.table.read().unwrap();
        std::iter::once(self.self_member())
            .chain(table.alive.values().cloned())
            .collect()
    }

    fn is_alive(&self, pki_id: PkiId) -> bool {
        pki_id == self.self_pki_id || self.table.read().unwrap().alive.contains_key(&pki_id)
    }
}

/// Select up to `pull_peer_num` random alive peers, excluding self, for a
/// membership-pull round (spec.md §4.5's sync loop).
pub fn select_pull_targets(discovery: &Discovery, pull_peer_num: usize) -> Vec<PkiId> {
    let self_pki_id = discovery.self_pki_id;
    let candidates: Vec<NetworkMember> = discovery
        .alive_members()
        .into_iter()
        .filter(|m| m.pki_id != self_pki_id)
        .collect();
    select_peers(pull_peer_num, &candidates, |_| true)
        .into_iter()
        .map(|m| m.pki_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use rksync_common::{PeerIdentity, SigningIdentity};
    use std::sync::Mutex;

    struct RecordingPublisher {
        published: Mutex<Vec<crate::emitter::EmittedMessage>>,
    }

    impl RecordingPublisher {
        fn new() -> Arc<Self> {
            Arc::new(Self { published: Mutex::new(Vec::new()) })
        }
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, message: crate::emitter::EmittedMessage) {
            self.published.lock().unwrap().push(message);
        }
    }

    fn discovery_with(endpoint: &str) -> (Arc<Discovery>, Arc<RecordingPublisher>) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let identity = PeerIdentity::new(format!("{endpoint}:node"), signing_key.verifying_key().to_bytes().to_vec());
        let mapper = Arc::new(IdentityMapper::new(SigningIdentity::new(signing_key, identity)));
        let publisher = RecordingPublisher::new();
        let config = GossipConfig::builder().endpoint(endpoint).build();
        let discovery = Discovery::new(config, 1, mapper, publisher.clone(), Box::new(policy::DefaultDisclosurePolicy));
        (discovery, publisher)
    }

    fn alive_message_for(pki_id: PkiId, endpoint: &str, seq: u64) -> AliveMessage {
        AliveMessage {
            membership: Some(proto::NetworkMember {
                endpoint: endpoint.to_string(),
                pki_id: pki_id.as_bytes().to_vec(),
                metadata: vec![],
            }),
            timestamp: Some(message::peer_time_to_proto(PeerTime::new(1, seq))),
            identity: vec![],
        }
    }

    #[test]
    fn emit_alive_increments_seq_num_and_publishes() {
        let (discovery, publisher) = discovery_with("node-a:9000");
        discovery.emit_alive();
        discovery.emit_alive();
        assert_eq!(publisher.published.lock().unwrap().len(), 2);
    }

    #[test]
    fn unknown_peer_alive_message_is_accepted_and_triggers_membership_request() {
        let (discovery, publisher) = discovery_with("node-a:9000");
        let peer = PkiId([7; 32]);
        let accepted = discovery.handle_alive(alive_message_for(peer, "node-b:9001", 1), peer).unwrap();
        assert!(accepted);
        assert!(discovery.is_alive(peer));
        // emit_alive() publishes nothing here; the single publish is the
        // auto-generated membership request for the newly seen peer.
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[test]
    fn stale_alive_message_is_discarded() {
        let (discovery, _publisher) = discovery_with("node-a:9000");
        let peer = PkiId([7; 32]);
        assert!(discovery.handle_alive(alive_message_for(peer, "node-b:9001", 5), peer).unwrap());
        assert!(!discovery.handle_alive(alive_message_for(peer, "node-b:9001", 3), peer).unwrap());
        assert!(!discovery.handle_alive(alive_message_for(peer, "node-b:9001", 5), peer).unwrap());
    }

    #[test]
    fn dead_peer_is_resurrected_by_fresh_alive_message() {
        let (discovery, _publisher) = discovery_with("node-a:9000");
        let peer = PkiId([7; 32]);
        discovery.handle_alive(alive_message_for(peer, "node-b:9001", 1), peer).unwrap();
        discovery.mark_presumed_dead(peer);
        assert!(!discovery.is_alive(peer));
        discovery.handle_alive(alive_message_for(peer, "node-b:9001", 2), peer).unwrap();
        assert!(discovery.is_alive(peer));
    }

    #[test]
    fn sweep_moves_alive_to_dead_then_evicts() {
        let (discovery, _publisher) = discovery_with("node-a:9000");
        let peer = PkiId([7; 32]);
        discovery.handle_alive(alive_message_for(peer, "node-b:9001", 1), peer).unwrap();

        let far_future = Instant::now() + discovery.config.alive_expiration_timeout() + std::time::Duration::from_secs(1);
        discovery.sweep(far_future);
        assert!(!discovery.is_alive(peer));
        assert!(discovery.table.read().unwrap().dead.contains_key(&peer));

        let evict_at = Instant::now() + discovery.config.eviction_timeout() + std::time::Duration::from_secs(1);
        discovery.sweep(evict_at);
        assert!(!discovery.table.read().unwrap().dead.contains_key(&peer));
        assert!(discovery.alive_store.is_empty());
    }

    #[test]
    fn membership_request_excludes_known_peers() {
        let (discovery, _publisher) = discovery_with("node-a:9000");
        let known_peer = PkiId([7; 32]);
        let unknown_peer = PkiId([8; 32]);
        discovery.handle_alive(alive_message_for(known_peer, "node-b:9001", 1), known_peer).unwrap();
        discovery.handle_alive(alive_message_for(unknown_peer, "node-c:9002", 1), unknown_peer).unwrap();

        let req = proto::MembershipRequest {
            self_information: Some(alive_message_for(PkiId([9; 32]), "node-d:9003", 1)),
            known: vec![known_peer.as_bytes().to_vec()],
        };
        let response = discovery.handle_membership_request(req);
        let disclosed: Vec<PkiId> = response
            .alive
            .iter()
            .filter_map(|a| a.membership.as_ref().and_then(|m| pki_from_bytes(&m.pki_id)))
            .collect();
        assert_eq!(disclosed, vec![unknown_peer]);
    }

    #[test]
    fn membership_response_merges_new_alive_peers() {
        let (discovery, _publisher) = discovery_with("node-a:9000");
        let peer = PkiId([5; 32]);
        let response = proto::MembershipResponse {
            alive: vec![alive_message_for(peer, "node-e:9004", 1)],
            dead: vec![],
        };
        discovery.handle_membership_response(response);
        assert!(discovery.is_alive(peer));
    }
}
