// Copyright (c) 2018-2022 The Botho Foundation

//! Shared wire-adjacent types and the small injected interfaces the Design
//! Notes call for (`PeerSelector`, `Publisher`) instead of the cyclic
//! Discovery/Channel/Emitter object graph the original service wires up
//! (spec.md §9).

use rksync_common::PkiId;
use rksync_transport::proto;

/// `{endpoint, pkiId, metadata}` (spec.md §3). An alive member has a
/// non-empty endpoint; a dead record may retain only the pki-id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkMember {
    /// Dial-able endpoint, or empty for a bare dead-record.
    pub endpoint: String,
    /// The member's PKI-id.
    pub pki_id: PkiId,
    /// Opaque application metadata carried alongside membership.
    pub metadata: Vec<u8>,
}

impl NetworkMember {
    /// Build an alive record.
    pub fn new(endpoint: impl Into<String>, pki_id: PkiId, metadata: Vec<u8>) -> Self {
        Self {
            endpoint: endpoint.into(),
            pki_id,
            metadata,
        }
    }

    /// A dead record retaining only the pki-id.
    pub fn dead(pki_id: PkiId) -> Self {
        Self {
            endpoint: String::new(),
            pki_id,
            metadata: Vec::new(),
        }
    }

    /// Whether this record carries a dial-able endpoint.
    pub fn is_alive_record(&self) -> bool {
        !self.endpoint.is_empty()
    }

    /// Convert to the wire representation.
    pub fn to_proto(&self) -> proto::NetworkMember {
        crate::message::network_member_to_proto(&self.endpoint, self.pki_id, self.metadata.clone())
    }

    /// Parse from the wire representation. `None` if the pki-id is malformed.
    pub fn from_proto(member: &proto::NetworkMember) -> Option<Self> {
        let pki_id = crate::message::network_member_pki_id(member)?;
        Some(Self {
            endpoint: member.endpoint.clone(),
            pki_id,
            metadata: member.metadata.clone(),
        })
    }
}

/// Membership plus routing-filter primitives a leaf component needs, without
/// a back-reference to the whole service (spec.md §9's "explicit small
/// interfaces"). Implemented by [`crate::discovery::Discovery`].
pub trait PeerSelector: Send + Sync {
    /// Every currently-alive member, including self if present.
    fn alive_members(&self) -> Vec<NetworkMember>;

    /// Whether `pki_id` is presently considered alive.
    fn is_alive(&self, pki_id: PkiId) -> bool;
}

/// The sink leaf components push outbound messages into. Implemented by
/// [`crate::emitter::Emitter`]; kept as a trait so Discovery and Channel
/// depend on "a place to publish", not the emitter's internals.
pub trait Publisher: Send + Sync {
    /// Queue a message for propagation.
    fn publish(&self, message: crate::emitter::EmittedMessage);
}

/// Select up to `k` members matching `filter`, chosen uniformly at random
/// without replacement (spec.md §4.7's `SelectPeers`).
pub fn select_peers(
    k: usize,
    members: &[NetworkMember],
    filter: impl Fn(&NetworkMember) -> bool,
) -> Vec<NetworkMember> {
    use rand::seq::SliceRandom;

    let mut candidates: Vec<&NetworkMember> = members.iter().filter(|m| filter(m)).collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates.into_iter().take(k).cloned().collect()
}
