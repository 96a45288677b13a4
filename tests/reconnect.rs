// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

mod support;

use std::sync::Arc;
use std::time::Duration;

use modbus_tcp_stack::prelude::*;
use support::{spawn_server, MemoryHandler};
use tokio::net::TcpListener;

#[tokio::test]
async fn client_reconnects_after_the_peer_restarts() {
    let handler = Arc::new(MemoryHandler::new());
    let server_options = ServerOptions::new().with_read_timeout(Duration::from_millis(50));
    let (server_a, addr, task_a) = spawn_server(Arc::clone(&handler) as _, server_options.clone()).await;

    let client = Client::new(
        addr,
        ClientOptions::new()
            .with_unit_id(1)
            .with_auto_reconnect(true)
            .with_max_retries(5)
            .with_reconnect_backoff(Duration::from_millis(30))
            .with_max_reconnect_time(Duration::from_millis(200)),
    );
    client.connect().await.unwrap();
    client.read_holding_registers(0, 1).await.unwrap();

    // Take the peer down; give its accept loop time to notice and the
    // in-flight connection worker time to drop its socket.
    server_a.close().await;
    task_a.await.unwrap().unwrap();

    // Bring a fresh listener up on the same address once the old one
    // has released the port.
    let restart = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        let listener = TcpListener::bind(addr).await.expect("port should be free again");
        let server_b = Server::new(handler, server_options);
        server_b.serve(listener).await.unwrap();
    });

    let regs = tokio::time::timeout(
        Duration::from_secs(3),
        client.read_holding_registers(0, 1),
    )
    .await
    .expect("reconnect should succeed within the test timeout")
    .unwrap();
    assert_eq!(regs, vec![0]);
    assert!(client.metrics.reconnections.get() >= 1);

    client.close().await;
    restart.abort();
}
