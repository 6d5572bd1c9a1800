// Copyright (c) 2018-2022 The Botho Foundation

//! Channel-restricted data sync: the pluggable extension point spec.md §9(b)
//! calls for. The core schema only carries `ChainState`/pull request-response
//! traffic; actual file-content transfer is an application concern injected
//! into [`crate::channel::Channel`] through this trait.

use crate::error::GossipResult;
use rksync_common::PkiId;

/// Handles channel-restricted payloads that aren't chain-state traffic
/// (spec.md §9(b): "treat as a pluggable per-channel handler extending
/// beyond this core"). `payload` is whatever bytes the embedder's own wire
/// format carries; this crate does not interpret them.
pub trait DataSyncHandler: Send + Sync {
    /// Handle an inbound data-sync payload for `chain_id`, received from
    /// `from`.
    fn handle(&self, chain_id: &str, from: PkiId, payload: &[u8]) -> GossipResult<()>;
}

/// The default handler: accepts and discards. Channels that never need file
/// transfer (membership/leader tracking only) use this.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDataSyncHandler;

impl DataSyncHandler for NoopDataSyncHandler {
    fn handle(&self, _chain_id: &str, _from: PkiId, _payload: &[u8]) -> GossipResult<()> {
        Ok(())
    }
}
