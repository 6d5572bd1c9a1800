// Copyright (c) 2018-2023 The Botho Foundation

//! The accept side of the `RKSync` gRPC service: handles the acceptor's
//! half of the `SyncStream` handshake and wires new connections into the
//! [`TransportAdapter`]'s connection cache.

use crate::{
    adapter::TransportAdapter,
    connection::{extract_conn_establish, frame_conn_establish, spawn_reader, PeerConnection},
    error::{Result as TransportResult, TransportError},
    proto::{rk_sync_server::RkSync, ConnEstablish, Empty, Envelope},
};
use futures::{Stream, StreamExt};
use rksync_common::PkiId;
use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc};
use tokio::sync::mpsc;
use tonic::{transport::Server, Request, Response, Status, Streaming};
use tracing::{debug, info};

type ResponseStream = Pin<Box<dyn Stream<Item = Result<Envelope, Status>> + Send>>;

/// Resolves and authenticates a dialer's claimed identity, handing back
/// their confirmed PKI-id. Owned by the Identity Mapper (L1); the server
/// only invokes it.
pub type ResolveRemote =
    Arc<dyn Fn(&ConnEstablish) -> Result<PkiId, TransportError> + Send + Sync>;

/// The `RKSync` service implementation used on the accept side.
pub struct RKSyncServer {
    adapter: Arc<TransportAdapter>,
    self_establish: ConnEstablish,
    resolve_remote: ResolveRemote,
}

impl RKSyncServer {
    /// Build the service. `self_establish` is this node's own
    /// `ConnEstablish`, sent back to every dialer as the handshake
    /// response; `resolve_remote` verifies a dialer's claimed identity.
    pub fn new(
        adapter: Arc<TransportAdapter>,
        self_establish: ConnEstablish,
        resolve_remote: ResolveRemote,
    ) -> Self {
        Self {
            adapter,
            self_establish,
            resolve_remote,
        }
    }

    /// Bind `addr` and serve the `RKSync` RPC until `shutdown` resolves.
    /// This is the only place the engine actually listens on a socket; every
    /// other transport operation dials out.
    pub async fn serve(self, addr: SocketAddr, shutdown: impl Future<Output = ()> + Send + 'static) -> TransportResult<()> {
        info!(%addr, "accept server listening");
        Server::builder()
            .add_service(crate::proto::rk_sync_server::RkSyncServer::new(self))
            .serve_with_shutdown(addr, shutdown)
            .await
            .map_err(TransportError::from)
    }
}

#[tonic::async_trait]
impl RkSync for RKSyncServer {
    type SyncStreamStream = ResponseStream;

    async fn sync_stream(
        &self,
        request: Request<Streaming<Envelope>>,
    ) -> Result<Response<Self::SyncStreamStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty stream"))?;
        let dialer_establish = extract_conn_establish(&first)
            .ok_or_else(|| Status::invalid_argument("first message was not a ConnEstablish"))?;

        let confirmed_pki_id = (self.resolve_remote)(&dialer_establish)
            .map_err(|e| Status::permission_denied(e.to_string()))?;

        // The cached connection's outbound half is this channel: anything
        // `TransportAdapter::send` enqueues for `confirmed_pki_id` is
        // written here and streamed back to the dialer as the RPC
        // response; the handshake reply goes out over the same channel as
        // the very first message.
        let (outbound_tx, outbound_rx) =
            mpsc::channel::<Envelope>(crate::connection::SEND_QUEUE_DEPTH);
        outbound_tx
            .send(frame_conn_establish(self.self_establish.clone()))
            .await
            .map_err(|_| Status::internal("failed to queue handshake response"))?;

        let adapter = self.adapter.clone();
        let sink: Arc<dyn crate::connection::InboundSink> = adapter.clone();
        let task = spawn_reader(Arc::new(std::sync::RwLock::new(confirmed_pki_id)), inbound, sink);
        let conn = PeerConnection::from_parts(confirmed_pki_id, outbound_tx, task);
        adapter.register_connection(confirmed_pki_id, Arc::new(conn));
        debug!(pki_id = %confirmed_pki_id, "accepted connection");

        let response_stream = tokio_stream::wrappers::ReceiverStream::new(outbound_rx).map(Ok);
        Ok(Response::new(Box::pin(response_stream)))
    }

    async fn ping(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        Ok(Response::new(Empty {}))
    }
}
