// Copyright (c) 2018-2022 The Botho Foundation

//! Error kinds for the gossip engine (spec.md §7).

use displaydoc::Display;

/// The engine's error kinds. API calls return these directly; loop code
/// (acceptMessages, syncDiscovery, ...) logs and drops instead of
/// propagating, per spec.md §7's propagation policy.
#[derive(Debug, Display, thiserror::Error)]
pub enum GossipError {
    /// invalid input: {0}
    InvalidInput(String),
    /// not found: {0}
    NotFound(String),
    /// mutation rejected: only the channel leader may perform this operation
    NotLeader,
    /// signature verification failed
    SignatureInvalid,
    /// identity conflict: pki-id already bound to a different identity
    IdentityConflict,
    /// service is stopped or stopping
    Stopped,
    /// transport error: {0}
    Transport(#[from] rksync_transport::TransportError),
    /// stale message: {0}
    Stale(String),
}

/// Result alias for gossip engine operations.
pub type GossipResult<T> = core::result::Result<T, GossipError>;
