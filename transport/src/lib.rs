// Copyright (c) 2018-2023 The Botho Foundation
// Copyright (c) 2024 Botho Foundation

//! The Transport Adapter (L4): the only component that speaks gRPC.
//!
//! It wraps the generated `RKSync` tonic service (`SyncStream`/`Ping`) behind
//! four small operations the rest of the engine actually needs: accept a
//! filtered view of the inbound envelope stream, send to a set of peers,
//! probe a peer's liveness, and perform the identity-verifying handshake. A
//! connection cache keyed by PKI-id avoids redialing, and a `PresumedDead`
//! channel reports peers the transport could no longer reach.

#![warn(missing_docs)]

mod adapter;
mod connection;
mod credentials;
mod error;
mod server;

/// Generated protobuf/tonic types: `RKSyncMessage`, `Envelope`,
/// `rk_sync_server`/`rk_sync_client`, and every content sub-message listed
/// in spec.md §6.
pub mod proto {
    tonic::include_proto!("rksync");
}

pub use adapter::{Accepted, ConnectionStats, ReceivedMessage, TransportAdapter, TransportAdapterConfig};
pub use credentials::{
    AnyCredentialsError, AnyCredentialsProvider, BasicCredentials, CredentialsProvider,
    CredentialsProviderError, HardcodedCredentialsProvider,
};
pub use error::{Result, TransportError};
pub use server::{RKSyncServer, ResolveRemote};
