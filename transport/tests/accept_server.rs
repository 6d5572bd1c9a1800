// Copyright (c) 2018-2023 The Botho Foundation

//! Cross-module integration test for the accept side of the `RKSync`
//! service: binds a real socket, dials it with a real tonic client, and
//! confirms the server answers and shuts down cleanly on signal.

use std::{sync::Arc, time::Duration};

use rksync_common::PkiId;
use rksync_transport::{
    proto::{rk_sync_client::RkSyncClient, ConnEstablish, Empty},
    RKSyncServer, ResolveRemote, TransportAdapter, TransportAdapterConfig,
};
use tokio::sync::Notify;
use tonic::transport::Endpoint;

#[tokio::test]
async fn serve_accepts_ping_then_stops_on_shutdown() {
    // Grab an ephemeral port, then release it immediately so `serve` can
    // bind it: a brief race, the same trick used throughout this workspace's
    // teacher for picking a free test port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let adapter = TransportAdapter::new(PkiId([0; 32]), TransportAdapterConfig::default());
    let self_establish = ConnEstablish { pki_id: vec![0; 32], identity: vec![] };
    let resolve_remote: ResolveRemote = Arc::new(|_establish: &ConnEstablish| Ok(PkiId([1; 32])));
    let server = RKSyncServer::new(adapter, self_establish, resolve_remote);

    let shutdown = Arc::new(Notify::new());
    let server_shutdown = shutdown.clone();
    let task = tokio::spawn(async move {
        server.serve(addr, async move { server_shutdown.notified().await }).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let channel = Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = RkSyncClient::new(channel);
    client.ping(Empty {}).await.expect("ping should succeed once the server is listening");

    shutdown.notify_waiters();
    task.await.unwrap().expect("serve should shut down cleanly");
}
