// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use modbus_tcp_stack::prelude::*;
use support::{spawn_server, MemoryHandler};

#[tokio::test]
async fn exhausted_pool_times_out_then_recovers_on_return() {
    let handler = Arc::new(MemoryHandler::new());
    let (server, addr, _task) = spawn_server(handler, ServerOptions::new()).await;

    let pool = Pool::new(
        addr,
        PoolOptions::new()
            .with_size(2)
            .with_health_check_freq(Duration::ZERO),
    );

    let mut first = pool.get(None).await.unwrap();
    let _second = pool.get(None).await.unwrap();

    let deadline = Some(Instant::now() + Duration::from_millis(100));
    let err = pool
        .get(deadline)
        .await
        .expect_err("pool is at capacity and should time out, not create a third client");
    assert!(matches!(err, Error::PoolTimeout));
    assert_eq!(pool.metrics().timeouts.get(), 1);

    first.close().await;
    let third = pool.get(None).await.unwrap();
    assert_eq!(
        pool.metrics().hits.get(),
        1,
        "the returned client should satisfy the next acquire without creating a new one"
    );

    drop(third);
    pool.close().await;
    server.close().await;
}
