// Copyright (c) 2018-2022 The Botho Foundation

//! The Identity Mapper (L1): binds `PKI-id → serialized identity`, signs
//! outbound messages, and verifies signatures on inbound ones (spec.md
//! §4.1).

use crate::error::{GossipError, GossipResult};
use ed25519_dalek::Signature;
use rksync_common::{pki_id_of, PeerIdentity, PkiId, SigningIdentity};
use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

struct Entry {
    identity: PeerIdentity,
    last_used: Instant,
}

/// Maps peer PKI-ids to their serialized identity, with TTL-based eviction.
/// Put/Get are serialized by a single lock; Verify reads under a shared lock
/// (spec.md §4.1's concurrency note).
pub struct IdentityMapper {
    self_identity: SigningIdentity,
    entries: RwLock<HashMap<PkiId, Entry>>,
}

impl IdentityMapper {
    /// Build a mapper around this node's own signing identity. The node's
    /// own pki-id is pre-bound so `Get(self_pki_id)` never misses.
    pub fn new(self_identity: SigningIdentity) -> Self {
        let self_pki_id = self_identity.pki_id();
        let mut entries = HashMap::new();
        entries.insert(
            self_pki_id,
            Entry {
                identity: self_identity.identity().clone(),
                last_used: Instant::now(),
            },
        );
        Self {
            self_identity,
            entries: RwLock::new(entries),
        }
    }

    /// This node's own pki-id.
    pub fn self_pki_id(&self) -> PkiId {
        self.self_identity.pki_id()
    }

    /// This node's own identity, for embedding in `ConnEstablish`/alive
    /// messages.
    pub fn self_identity(&self) -> &PeerIdentity {
        self.self_identity.identity()
    }

    /// Bind `pkiId → identity`. Verifies `pkiIdOf(identity) == pkiId`;
    /// rejects a rebind to a different identity as *identity-conflict*
    /// (idempotent for an identical rebind).
    pub fn put(&self, pki_id: PkiId, identity: PeerIdentity) -> GossipResult<()> {
        if pki_id_of(&identity) != pki_id {
            return Err(GossipError::InvalidInput(
                "pkiIdOf(identity) does not match claimed pki-id".into(),
            ));
        }

        let mut entries = self.entries.write().unwrap();
        match entries.get(&pki_id) {
            Some(existing) if existing.identity == identity => {
                // Idempotent rebind.
            }
            Some(existing) if existing.identity != identity => {
                warn!(%pki_id, "identity conflict: pki-id already bound to a different identity");
                return Err(GossipError::IdentityConflict);
            }
            _ => {
                debug!(%pki_id, "bound new identity");
            }
        }
        entries.insert(
            pki_id,
            Entry {
                identity,
                last_used: Instant::now(),
            },
        );
        Ok(())
    }

    /// Resolve `pkiId`'s bound identity, touching its last-used timestamp.
    pub fn get(&self, pki_id: PkiId) -> GossipResult<PeerIdentity> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .get_mut(&pki_id)
            .ok_or_else(|| GossipError::NotFound(format!("no identity bound for {pki_id}")))?;
        entry.last_used = Instant::now();
        Ok(entry.identity.clone())
    }

    /// Sign `bytes` with the node's own private key.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.self_identity.sign(bytes)
    }

    /// Resolve `pkiId` and verify `signature` over `message` against its
    /// embedded public key.
    pub fn verify(&self, pki_id: PkiId, signature: &Signature, message: &[u8]) -> GossipResult<()> {
        let entries = self.entries.read().unwrap();
        let entry = entries
            .get(&pki_id)
            .ok_or_else(|| GossipError::NotFound(format!("no identity bound for {pki_id}")))?;
        let public_key = entry
            .identity
            .public_key()
            .map_err(|_| GossipError::SignatureInvalid)?;
        if rksync_common::verify(&public_key, message, signature) {
            Ok(())
        } else {
            Err(GossipError::SignatureInvalid)
        }
    }

    /// Purge entries unused for longer than `ttl`, invoking `notifier` for
    /// each pki-id purged (the service uses this to close the transport
    /// connection — spec.md §4.1). Never purges the node's own identity.
    pub fn sweep(&self, ttl: Duration, mut notifier: impl FnMut(PkiId)) {
        let self_pki_id = self.self_pki_id();
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        let expired: Vec<PkiId> = entries
            .iter()
            .filter(|(pki_id, entry)| **pki_id != self_pki_id && now.duration_since(entry.last_used) > ttl)
            .map(|(pki_id, _)| *pki_id)
            .collect();
        for pki_id in expired {
            entries.remove(&pki_id);
            notifier(pki_id);
        }
    }

    /// Number of bound identities, including self.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether only the self-identity is bound.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

/// Serialize a peer identity for the `identity` bytes field carried on
/// `ConnEstablish` and on alive messages during the warm-up window.
pub fn encode_identity(identity: &PeerIdentity) -> Vec<u8> {
    serde_json::to_vec(identity).expect("PeerIdentity is always serializable")
}

/// Parse a serialized peer identity. `None` on malformed bytes.
pub fn decode_identity(bytes: &[u8]) -> Option<PeerIdentity> {
    serde_json::from_slice(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn fake_identity(node_id: &str) -> (SigningKey, PeerIdentity) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let identity = PeerIdentity::new(node_id, signing_key.verifying_key().to_bytes().to_vec());
        (signing_key, identity)
    }

    fn mapper() -> IdentityMapper {
        let (key, identity) = fake_identity("self:9000");
        IdentityMapper::new(SigningIdentity::new(key, identity))
    }

    #[test]
    fn put_then_get_is_idempotent() {
        let mapper = mapper();
        let (_key, identity) = fake_identity("peer-a:9000");
        let pki_id = pki_id_of(&identity);

        mapper.put(pki_id, identity.clone()).unwrap();
        mapper.put(pki_id, identity.clone()).unwrap();
        assert_eq!(mapper.get(pki_id).unwrap(), identity);
    }

    #[test]
    fn put_rejects_mismatched_pki_id() {
        let mapper = mapper();
        let (_key, identity) = fake_identity("peer-a:9000");
        let wrong_id = PkiId([0xAB; 32]);
        assert!(matches!(
            mapper.put(wrong_id, identity),
            Err(GossipError::InvalidInput(_))
        ));
    }

    #[test]
    fn put_rejects_identity_whose_hash_does_not_match_bound_claim() {
        // pkiId is SHA256(nodeId ‖ cert), so a genuine identity-conflict
        // (same pkiId, different identity) would require a hash collision;
        // any mismatched identity is instead rejected up front as
        // InvalidInput before the conflict check is reached.
        let mapper = mapper();
        let (_key_a, identity_a) = fake_identity("peer-a:9000");
        let pki_id = pki_id_of(&identity_a);
        mapper.put(pki_id, identity_a).unwrap();

        let (_key_b, identity_b) = fake_identity("peer-b:9000");
        assert!(matches!(
            mapper.put(pki_id, identity_b),
            Err(GossipError::InvalidInput(_))
        ));
    }

    #[test]
    fn get_missing_is_not_found() {
        let mapper = mapper();
        assert!(matches!(
            mapper.get(PkiId([0x11; 32])),
            Err(GossipError::NotFound(_))
        ));
    }

    #[test]
    fn sign_and_verify_round_trip_through_mapper() {
        let mapper = mapper();
        let self_pki_id = mapper.self_pki_id();
        // The self-identity is pre-bound so verification of our own
        // messages works without an explicit Put.
        let sig = mapper.sign(b"hello");
        assert!(mapper.verify(self_pki_id, &sig, b"hello").is_ok());
        assert!(mapper.verify(self_pki_id, &sig, b"tampered").is_err());
    }

    #[test]
    fn sweep_purges_unused_entries_but_never_self() {
        let mapper = mapper();
        let (_key, identity) = fake_identity("peer-a:9000");
        let pki_id = pki_id_of(&identity);
        mapper.put(pki_id, identity).unwrap();

        let mut purged = Vec::new();
        mapper.sweep(Duration::from_secs(0), |id| purged.push(id));
        assert_eq!(purged, vec![pki_id]);
        assert!(mapper.get(pki_id).is_err());
        assert!(mapper.get(mapper.self_pki_id()).is_ok());
    }
}
