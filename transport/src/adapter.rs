// Copyright (c) 2018-2023 The Botho Foundation

//! The Transport Adapter (L4): accept-filter demultiplexer, send/probe/
//! handshake, and the connection cache, per spec.md §4.4.

use crate::{
    connection::{InboundSink, PeerConnection},
    error::{Result, TransportError},
    proto::{self, rk_sync_client::RkSyncClient, ConnEstablish, Empty},
};
use rksync_common::PkiId;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tonic::transport::Endpoint;
use tracing::{debug, warn};

/// An inbound envelope, tagged with the sender's PKI-id, delivered to a
/// registered [`Accepted`] subscriber.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    /// The sender, resolved at handshake time.
    pub from: PkiId,
    /// The raw framed envelope.
    pub envelope: proto::Envelope,
}

/// A predicate-filtered view of the inbound stream, returned by
/// [`TransportAdapter::accept`].
pub struct Accepted {
    rx: mpsc::Receiver<ReceivedMessage>,
}

impl Accepted {
    /// Await the next message matching this subscriber's predicate.
    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        self.rx.recv().await
    }
}

type Predicate = Box<dyn Fn(&ReceivedMessage) -> bool + Send + Sync>;

struct Subscriber {
    predicate: Predicate,
    tx: mpsc::Sender<ReceivedMessage>,
}

/// Tunables for dialing and probing peers.
#[derive(Clone, Copy, Debug)]
pub struct TransportAdapterConfig {
    /// Dial timeout for `connect`/`handshake`.
    pub dial_timeout: Duration,
    /// RPC timeout for `Probe`.
    pub probe_timeout: Duration,
    /// Depth of each subscriber's inbound queue (lossy fan-out beyond this).
    pub subscriber_queue_depth: usize,
}

impl Default for TransportAdapterConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            subscriber_queue_depth: 256,
        }
    }
}

/// A point-in-time snapshot of the adapter's connection cache, for
/// diagnostics and tests (see SPEC_FULL.md §4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Connections currently cached, either dialed or accepted.
    pub open_connections: usize,
    /// Lifetime count of peers this adapter has marked presumed-dead.
    pub presumed_dead_total: u64,
}

/// The transport adapter. One instance per running node.
pub struct TransportAdapter {
    config: TransportAdapterConfig,
    self_pki_id: PkiId,
    connections: RwLock<HashMap<PkiId, Arc<PeerConnection>>>,
    subscribers: RwLock<Vec<Subscriber>>,
    presumed_dead_tx: mpsc::Sender<PkiId>,
    presumed_dead_rx: tokio::sync::Mutex<mpsc::Receiver<PkiId>>,
    presumed_dead_total: AtomicU64,
}

impl TransportAdapter {
    /// Construct a new adapter for a node identified by `self_pki_id`.
    pub fn new(self_pki_id: PkiId, config: TransportAdapterConfig) -> Arc<Self> {
        let (presumed_dead_tx, presumed_dead_rx) = mpsc::channel(256);
        Arc::new(Self {
            config,
            self_pki_id,
            connections: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            presumed_dead_tx,
            presumed_dead_rx: tokio::sync::Mutex::new(presumed_dead_rx),
            presumed_dead_total: AtomicU64::new(0),
        })
    }

    /// Register a new predicate-filtered subscriber over the inbound
    /// stream. Every registered predicate is applied to every inbound
    /// message (spec.md §4.4); a full subscriber queue silently drops the
    /// message for that subscriber only.
    pub fn accept(self: &Arc<Self>, predicate: impl Fn(&ReceivedMessage) -> bool + Send + Sync + 'static) -> Accepted {
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_depth);
        self.subscribers.write().unwrap().push(Subscriber {
            predicate: Box::new(predicate),
            tx,
        });
        Accepted { rx }
    }

    /// Fan an inbound message out to every subscriber whose predicate
    /// matches. Called by the accept-side server and by connection reader
    /// tasks via [`InboundSink`].
    fn dispatch(&self, message: ReceivedMessage) {
        let subscribers = self.subscribers.read().unwrap();
        for subscriber in subscribers.iter() {
            if (subscriber.predicate)(&message) {
                if subscriber.tx.try_send(message.clone()).is_err() {
                    warn!(from = %message.from, "dropping message: subscriber queue full");
                }
            }
        }
    }

    /// Enqueue `envelope` onto each of `peers`' outbound connection. A send
    /// failure marks that peer presumed-dead and does not fail the whole
    /// call (spec.md §4.4: "failures mark the peer presumed-dead via the
    /// `PresumedDead` channel").
    pub fn send(&self, envelope: &proto::Envelope, peers: &[PkiId]) {
        let connections = self.connections.read().unwrap();
        for peer in peers {
            match connections.get(peer) {
                Some(conn) => {
                    if conn.try_send(envelope.clone()).is_err() {
                        self.mark_presumed_dead(*peer);
                    }
                }
                None => self.mark_presumed_dead(*peer),
            }
        }
    }

    fn mark_presumed_dead(&self, peer: PkiId) {
        self.presumed_dead_total.fetch_add(1, Ordering::Relaxed);
        let _ = self.presumed_dead_tx.try_send(peer);
    }

    /// Receive the next peer the transport has given up on. Feeds
    /// Discovery's `handlePresumedDead` loop (spec.md §4.7).
    pub async fn next_presumed_dead(&self) -> Option<PkiId> {
        self.presumed_dead_rx.lock().await.recv().await
    }

    /// One-shot liveness probe: dial `endpoint` and call `Ping`.
    pub async fn probe(&self, endpoint: &str) -> Result<()> {
        let channel = tokio::time::timeout(self.config.dial_timeout, async {
            Endpoint::from_shared(endpoint.to_string())
                .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?
                .connect()
                .await
                .map_err(TransportError::from)
        })
        .await
        .map_err(|_| TransportError::Unreachable(endpoint.to_string()))??;

        let mut client = RkSyncClient::new(channel);
        tokio::time::timeout(self.config.probe_timeout, client.ping(Empty {}))
            .await
            .map_err(|_| TransportError::Unreachable(endpoint.to_string()))??;
        Ok(())
    }

    /// Open a stream to `endpoint`, exchange a signed `ConnEstablish`, and
    /// verify that `pkiIdOf(remoteIdentity)` matches the PKI-id the peer
    /// claimed. `resolve_remote` decodes the peer's `ConnEstablish.identity`
    /// bytes and checks it against `ConnEstablish.pki_id`; this is owned by
    /// the Identity Mapper (L1), not the transport, so it is injected as a
    /// closure rather than hardcoded here. On success the connection is
    /// cached under the confirmed PKI-id.
    pub async fn handshake(
        self: &Arc<Self>,
        endpoint: &str,
        self_identity_bytes: Vec<u8>,
        resolve_remote: impl FnOnce(&ConnEstablish) -> Result<PkiId>,
    ) -> Result<PkiId> {
        let self_establish = ConnEstablish {
            pki_id: self.self_pki_id.as_bytes().to_vec(),
            identity: self_identity_bytes,
        };
        let sink: Arc<dyn InboundSink> = self.clone() as Arc<dyn InboundSink>;

        let (mut conn, peer_establish) = tokio::time::timeout(
            self.config.dial_timeout,
            PeerConnection::connect(self.self_pki_id, endpoint, self_establish, sink),
        )
        .await
        .map_err(|_| TransportError::Unreachable(endpoint.to_string()))??;

        let confirmed_pki_id = resolve_remote(&peer_establish)?;
        conn.set_pki_id(confirmed_pki_id);
        self.connections
            .write()
            .unwrap()
            .insert(confirmed_pki_id, Arc::new(conn));
        Ok(confirmed_pki_id)
    }

    /// Record a connection under the PKI-id confirmed by the service layer
    /// after decoding the peer's `ConnEstablish`. Used on the accept side,
    /// where [`crate::server::RKSyncServer`] drives the handshake's
    /// response half.
    pub fn register_connection(&self, pki_id: PkiId, conn: Arc<PeerConnection>) {
        self.connections.write().unwrap().insert(pki_id, conn);
    }

    /// Tear down any cached connection to `peer`.
    pub fn close_conn(&self, peer: PkiId) {
        if self.connections.write().unwrap().remove(&peer).is_some() {
            debug!(%peer, "closed connection");
        }
    }

    /// Whether a connection to `peer` is currently cached.
    pub fn is_connected(&self, peer: PkiId) -> bool {
        self.connections.read().unwrap().contains_key(&peer)
    }

    /// Number of open connections (diagnostic surface, see SPEC_FULL.md §4).
    pub fn open_connections(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// Snapshot the adapter's connection-cache diagnostics.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            open_connections: self.open_connections(),
            presumed_dead_total: self.presumed_dead_total.load(Ordering::Relaxed),
        }
    }
}

impl InboundSink for TransportAdapter {
    fn deliver(&self, from: PkiId, envelope: proto::Envelope) {
        self.dispatch(ReceivedMessage { from, envelope });
    }

    fn connection_closed(&self, pki_id: PkiId) {
        self.close_conn(pki_id);
        self.mark_presumed_dead(pki_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pki(byte: u8) -> PkiId {
        PkiId([byte; 32])
    }

    #[tokio::test]
    async fn send_to_unknown_peer_marks_presumed_dead() {
        let adapter = TransportAdapter::new(pki(0), TransportAdapterConfig::default());
        let envelope = proto::Envelope {
            payload: vec![],
            signature: vec![],
        };
        adapter.send(&envelope, &[pki(1)]);
        assert_eq!(adapter.next_presumed_dead().await, Some(pki(1)));
    }

    #[tokio::test]
    async fn accept_filters_by_predicate() {
        let adapter = TransportAdapter::new(pki(0), TransportAdapterConfig::default());
        let mut matching = adapter.accept(|m| m.from == pki(1));
        let mut non_matching = adapter.accept(|m| m.from == pki(2));

        adapter.deliver(
            pki(1),
            proto::Envelope {
                payload: vec![1],
                signature: vec![],
            },
        );

        let received = matching.recv().await.expect("message delivered");
        assert_eq!(received.from, pki(1));
        assert!(tokio::time::timeout(Duration::from_millis(10), non_matching.recv())
            .await
            .is_err());
    }

    #[test]
    fn close_conn_on_unknown_peer_is_a_no_op() {
        let adapter = TransportAdapter::new(pki(0), TransportAdapterConfig::default());
        adapter.close_conn(pki(9));
        assert_eq!(adapter.open_connections(), 0);
    }

    #[tokio::test]
    async fn stats_counts_presumed_dead_across_repeated_send_failures() {
        let adapter = TransportAdapter::new(pki(0), TransportAdapterConfig::default());
        let envelope = proto::Envelope {
            payload: vec![],
            signature: vec![],
        };
        adapter.send(&envelope, &[pki(1)]);
        adapter.send(&envelope, &[pki(1), pki(2)]);

        let stats = adapter.stats();
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.presumed_dead_total, 3);
    }
}
