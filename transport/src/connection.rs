// Copyright (c) 2018-2023 The Botho Foundation

//! A single outbound connection to a peer: a tonic `SyncStream` plus the
//! bounded outbound queue and reader task that pumps it.

use crate::{
    error::{Result, TransportError},
    proto::{self, r_k_sync_message::Content, rk_sync_client::RkSyncClient, ConnEstablish},
};
use futures::StreamExt;
use prost::Message as _;
use rksync_common::PkiId;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::transport::Endpoint;
use tracing::{debug, trace, warn};

/// Fixed per-peer outbound queue depth (spec.md §5: "Per-peer send queues of
/// fixed depth (e.g. 100)").
pub const SEND_QUEUE_DEPTH: usize = 100;

/// Delivers an inbound envelope from a specific peer into the transport's
/// demultiplexer. Implemented by [`crate::adapter::TransportAdapter`]; kept
/// as a trait so the connection doesn't need a back-reference to the whole
/// adapter.
pub trait InboundSink: Send + Sync {
    /// Called once per inbound envelope received on this connection.
    fn deliver(&self, from: PkiId, envelope: proto::Envelope);
    /// Called when the connection's read side ends, for any reason.
    fn connection_closed(&self, pki_id: PkiId);
}

/// A live connection to one peer: an outbound queue and the task driving
/// the underlying bidirectional stream.
pub struct PeerConnection {
    /// Shared with the reader task so re-keying (`set_pki_id`) is visible to
    /// envelopes the reader is already delivering, not just to future ones.
    id_cell: Arc<RwLock<PkiId>>,
    outbound_tx: mpsc::Sender<proto::Envelope>,
    task: JoinHandle<()>,
}

/// Wrap a `ConnEstablish` as the sole content of a tag-EMPTY `RKSyncMessage`
/// and frame it as an (unsigned-at-this-layer) envelope. Signing is the
/// Identity Mapper's job; the transport only shapes the wire message.
pub fn frame_conn_establish(establish: ConnEstablish) -> proto::Envelope {
    let message = proto::RkSyncMessage {
        nonce: 0,
        channel: vec![],
        tag: proto::r_k_sync_message::Tag::Empty as i32,
        content: Some(Content::Conn(establish)),
    };
    proto::Envelope {
        payload: prost::Message::encode_to_vec(&message),
        signature: vec![],
    }
}

/// Extract a `ConnEstablish` from an envelope's payload, if that's what it
/// carries.
pub fn extract_conn_establish(envelope: &proto::Envelope) -> Option<ConnEstablish> {
    let message = proto::RkSyncMessage::decode(envelope.payload.as_slice()).ok()?;
    match message.content {
        Some(Content::Conn(establish)) => Some(establish),
        _ => None,
    }
}

impl PeerConnection {
    /// Dial `endpoint`, send our `ConnEstablish` as the first message, and
    /// block until the acceptor's `ConnEstablish` arrives (spec.md §6:
    /// "First message MUST be a ConnEstablish from the dialer; the
    /// acceptor responds with its own ConnEstablish"). Once that handshake
    /// completes, spawns the task that pumps the remainder of the stream
    /// into `sink`.
    ///
    /// Returns the connection, still keyed under our own PKI-id until the
    /// caller re-keys it under the peer's confirmed PKI-id once identity
    /// verification (owned by L1) succeeds.
    pub async fn connect(
        self_pki_id: PkiId,
        endpoint: &str,
        self_establish: ConnEstablish,
        sink: Arc<dyn InboundSink>,
    ) -> Result<(Self, ConnEstablish)> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?
            .connect()
            .await?;

        let mut client = RkSyncClient::new(channel);
        let (outbound_tx, outbound_rx) = mpsc::channel::<proto::Envelope>(SEND_QUEUE_DEPTH);
        let outbound_stream = tokio_stream::wrappers::ReceiverStream::new(outbound_rx);

        outbound_tx
            .send(frame_conn_establish(self_establish))
            .await
            .map_err(|_| TransportError::Closed)?;

        let response = client.sync_stream(outbound_stream).await?;
        let mut inbound = response.into_inner();

        let first = inbound
            .next()
            .await
            .ok_or_else(|| TransportError::HandshakeFailed("stream closed before reply".into()))?
            .map_err(TransportError::from)?;
        let peer_establish = extract_conn_establish(&first).ok_or_else(|| {
            TransportError::HandshakeFailed("first message was not a ConnEstablish".into())
        })?;

        // The peer's confirmed identity isn't known until the caller
        // resolves `peer_establish` against the Identity Mapper, which
        // happens after this function returns, but the reader task has to
        // start pumping `inbound` now so the handshake reply above can be
        // followed by real traffic without a gap. Share the key cell with
        // the reader so `set_pki_id` re-keys deliveries already in flight,
        // not just ones after the call returns.
        let id_cell = Arc::new(RwLock::new(self_pki_id));
        let task = spawn_reader(id_cell.clone(), inbound, sink);

        Ok((
            Self {
                id_cell,
                outbound_tx,
                task,
            },
            peer_establish,
        ))
    }

    /// Wrap an already-established bidirectional channel (used on the
    /// accept side, where the peer's identity is already confirmed before
    /// the stream and reader task are created).
    pub fn from_parts(
        pki_id: PkiId,
        outbound_tx: mpsc::Sender<proto::Envelope>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id_cell: Arc::new(RwLock::new(pki_id)),
            outbound_tx,
            task,
        }
    }

    /// The peer this connection currently belongs to.
    pub fn pki_id(&self) -> PkiId {
        *self.id_cell.read().unwrap()
    }

    /// Re-key this connection under its confirmed PKI-id, once the service
    /// layer has verified the peer's identity. Also re-keys the running
    /// reader task, so envelopes it's already pumping are attributed to the
    /// confirmed peer rather than to `self` (the key it was spawned under).
    pub fn set_pki_id(&mut self, pki_id: PkiId) {
        *self.id_cell.write().unwrap() = pki_id;
    }

    /// Enqueue an envelope for delivery. Drops and reports `QueueFull` if
    /// the bounded queue is already full, never blocking indefinitely.
    pub fn try_send(&self, envelope: proto::Envelope) -> Result<()> {
        self.outbound_tx
            .try_send(envelope)
            .map_err(|_| TransportError::QueueFull)
    }
}

/// Spawn the task that forwards every subsequent inbound envelope to `sink`,
/// tagged with whatever PKI-id `id` currently holds (so a later
/// [`PeerConnection::set_pki_id`] re-keys in-flight deliveries too), until
/// the stream ends.
pub(crate) fn spawn_reader(
    id: Arc<RwLock<PkiId>>,
    mut inbound: impl futures::Stream<Item = core::result::Result<proto::Envelope, tonic::Status>>
        + Unpin
        + Send
        + 'static,
    sink: Arc<dyn InboundSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match inbound.next().await {
                Some(Ok(envelope)) => {
                    let pki_id = *id.read().unwrap();
                    trace!(%pki_id, "inbound envelope");
                    sink.deliver(pki_id, envelope);
                }
                Some(Err(status)) => {
                    let pki_id = *id.read().unwrap();
                    warn!(%pki_id, %status, "stream error");
                    break;
                }
                None => {
                    let pki_id = *id.read().unwrap();
                    debug!(%pki_id, "stream closed by peer");
                    break;
                }
            }
        }
        sink.connection_closed(*id.read().unwrap());
    })
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    struct RecordingSink {
        delivered: Mutex<Vec<(PkiId, proto::Envelope)>>,
        closed: Mutex<Option<PkiId>>,
        notify: Notify,
    }

    impl InboundSink for RecordingSink {
        fn deliver(&self, from: PkiId, envelope: proto::Envelope) {
            self.delivered.lock().unwrap().push((from, envelope));
            self.notify.notify_one();
        }

        fn connection_closed(&self, pki_id: PkiId) {
            *self.closed.lock().unwrap() = Some(pki_id);
            self.notify.notify_one();
        }
    }

    fn envelope(tag: u8) -> proto::Envelope {
        proto::Envelope {
            payload: vec![tag],
            signature: vec![],
        }
    }

    /// Regression test for the dialer-side mis-attribution bug: the reader
    /// is spawned under the dialer's own id before the peer's identity is
    /// confirmed, and `set_pki_id` must re-key deliveries already in
    /// flight, not just future ones spawned after the call returns.
    #[tokio::test]
    async fn set_pki_id_rekeys_the_running_reader() {
        let dialer_id = PkiId([1; 32]);
        let confirmed_id = PkiId([2; 32]);

        let (tx, rx) = mpsc::channel::<core::result::Result<proto::Envelope, tonic::Status>>(4);
        let inbound = tokio_stream::wrappers::ReceiverStream::new(rx);
        let sink = Arc::new(RecordingSink {
            delivered: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
            notify: Notify::new(),
        });

        let id_cell = Arc::new(RwLock::new(dialer_id));
        let task = spawn_reader(id_cell.clone(), inbound, sink.clone());

        tx.send(Ok(envelope(1))).await.unwrap();
        sink.notify.notified().await;
        assert_eq!(sink.delivered.lock().unwrap()[0].0, dialer_id);

        // Identity confirmed: re-key as `PeerConnection::set_pki_id` would,
        // before the next envelope arrives.
        *id_cell.write().unwrap() = confirmed_id;

        tx.send(Ok(envelope(2))).await.unwrap();
        sink.notify.notified().await;
        assert_eq!(sink.delivered.lock().unwrap()[1].0, confirmed_id);

        drop(tx);
        sink.notify.notified().await;
        assert_eq!(*sink.closed.lock().unwrap(), Some(confirmed_id));

        task.await.unwrap();
    }
}
