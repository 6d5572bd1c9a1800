// Copyright (c) 2018-2022 The Botho Foundation

//! The disclosure policy (spec.md §4.5): a `(sieve, envelope_filter)` pair
//! deciding whether and in what form a peer's alive-message details are
//! revealed to another peer. Exposed as a single trait object, the same way
//! `gossip/src/store.rs` parameterizes `PeerStoreConfig`, so embedders can
//! swap the default without forking the crate (SPEC_FULL.md §4).

use crate::types::NetworkMember;
use rksync_transport::proto::AliveMessage;

/// The combined disclosure policy Discovery consults before including a
/// peer's alive-message in a `MembershipResponse`: whether to disclose
/// `candidate` to `requester` at all (`sieve`), and in what (possibly
/// redacted) form (`envelope_filter`).
pub trait DisclosurePolicy: Send + Sync {
    /// Whether to disclose `candidate` to `requester` at all.
    fn sieve(&self, candidate: &AliveMessage, requester: &NetworkMember) -> bool;
    /// The (possibly redacted) form to disclose.
    fn envelope_filter(&self, candidate: &AliveMessage) -> AliveMessage;
}

/// Default policy (spec.md §4.5): gossip alive messages only when both the
/// candidate's and the requester's endpoints are non-empty; the envelope is
/// cloned intact (no redaction).
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDisclosurePolicy;

impl DisclosurePolicy for DefaultDisclosurePolicy {
    fn sieve(&self, candidate: &AliveMessage, requester: &NetworkMember) -> bool {
        let candidate_endpoint_nonempty = candidate
            .membership
            .as_ref()
            .map(|m| !m.endpoint.is_empty())
            .unwrap_or(false);
        candidate_endpoint_nonempty && !requester.endpoint.is_empty()
    }

    fn envelope_filter(&self, candidate: &AliveMessage) -> AliveMessage {
        candidate.clone()
    }
}

/// A policy that strips `endpoint`/`metadata` from the disclosed member
/// record regardless of the sieve outcome, for deployments that never want
/// to disclose dial-able addresses through third parties
/// (`omitConcealedFields`, spec.md §4.5).
#[derive(Clone, Copy, Debug, Default)]
pub struct ConcealingDisclosurePolicy;

impl DisclosurePolicy for ConcealingDisclosurePolicy {
    fn sieve(&self, candidate: &AliveMessage, requester: &NetworkMember) -> bool {
        DefaultDisclosurePolicy.sieve(candidate, requester)
    }

    fn envelope_filter(&self, candidate: &AliveMessage) -> AliveMessage {
        let mut redacted = candidate.clone();
        if let Some(membership) = redacted.membership.as_mut() {
            membership.endpoint.clear();
            membership.metadata.clear();
        }
        redacted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rksync_transport::proto::{NetworkMember as ProtoMember, PeerTime};

    fn alive_with_endpoint(endpoint: &str) -> AliveMessage {
        AliveMessage {
            membership: Some(ProtoMember {
                endpoint: endpoint.to_string(),
                pki_id: vec![1; 32],
                metadata: vec![9, 9],
            }),
            timestamp: Some(PeerTime { inc_num: 1, seq_num: 1 }),
            identity: vec![],
        }
    }

    fn member(endpoint: &str) -> NetworkMember {
        NetworkMember::new(endpoint, rksync_common::PkiId([2; 32]), vec![])
    }

    #[test]
    fn default_policy_requires_both_endpoints_nonempty() {
        let policy = DefaultDisclosurePolicy;
        assert!(policy.sieve(&alive_with_endpoint("a:1"), &member("b:2")));
        assert!(!policy.sieve(&alive_with_endpoint(""), &member("b:2")));
        assert!(!policy.sieve(&alive_with_endpoint("a:1"), &member("")));
    }

    #[test]
    fn default_policy_clones_envelope_intact() {
        let policy = DefaultDisclosurePolicy;
        let candidate = alive_with_endpoint("a:1");
        let disclosed = policy.envelope_filter(&candidate);
        assert_eq!(disclosed, candidate);
    }

    #[test]
    fn concealing_policy_strips_endpoint_and_metadata() {
        let policy = ConcealingDisclosurePolicy;
        let candidate = alive_with_endpoint("a:1");
        let disclosed = policy.envelope_filter(&candidate);
        assert!(disclosed.membership.unwrap().endpoint.is_empty());
    }
}
