// Copyright (c) 2018-2023 The Botho Foundation

//! Transport-level errors.

use displaydoc::Display;

/// Transport adapter failure modes. All of these map onto the *transport*
/// error kind in spec.md §7 — callers never see a raw tonic/io error.
#[derive(Debug, Display, thiserror::Error)]
pub enum TransportError {
    /// peer unreachable: {0}
    Unreachable(String),
    /// handshake failed: {0}
    HandshakeFailed(String),
    /// remote identity's PKI-id did not match the claimed PKI-id
    IdentityMismatch,
    /// send queue to peer is full, peer presumed dead
    QueueFull,
    /// transport is shutting down
    Closed,
    /// gRPC error: {0}
    Rpc(String),
    /// invalid endpoint: {0}
    InvalidEndpoint(String),
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        TransportError::Rpc(status.message().to_string())
    }
}

impl From<tonic::transport::Error> for TransportError {
    fn from(err: tonic::transport::Error) -> Self {
        TransportError::Unreachable(err.to_string())
    }
}

/// Result alias for transport operations.
pub type Result<T> = core::result::Result<T, TransportError>;
