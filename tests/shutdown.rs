// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modbus_tcp_stack::prelude::*;
use modbus_tcp_stack::server::HandlerResult;
use support::spawn_server;

/// A handler whose `diagnostics` call blocks for a fixed interval, so
/// tests can assert that `Server::close` waits for it to finish
/// instead of cutting it off mid-flight.
struct SlowHandler {
    delay: Duration,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl RequestHandler for SlowHandler {
    async fn read_coils(&self, _unit_id: u8, _addr: u16, _qty: u16) -> HandlerResult<Vec<bool>> {
        Ok(vec![])
    }
    async fn read_discrete_inputs(
        &self,
        _unit_id: u8,
        _addr: u16,
        _qty: u16,
    ) -> HandlerResult<Vec<bool>> {
        Ok(vec![])
    }
    async fn write_single_coil(&self, _unit_id: u8, _addr: u16, _value: bool) -> HandlerResult<()> {
        Ok(())
    }
    async fn write_multiple_coils(
        &self,
        _unit_id: u8,
        _addr: u16,
        _values: &[bool],
    ) -> HandlerResult<()> {
        Ok(())
    }
    async fn read_holding_registers(
        &self,
        _unit_id: u8,
        _addr: u16,
        _qty: u16,
    ) -> HandlerResult<Vec<u16>> {
        Ok(vec![])
    }
    async fn read_input_registers(
        &self,
        _unit_id: u8,
        _addr: u16,
        _qty: u16,
    ) -> HandlerResult<Vec<u16>> {
        Ok(vec![])
    }
    async fn write_single_register(&self, _unit_id: u8, _addr: u16, _value: u16) -> HandlerResult<()> {
        Ok(())
    }
    async fn write_multiple_registers(
        &self,
        _unit_id: u8,
        _addr: u16,
        _values: &[u16],
    ) -> HandlerResult<()> {
        Ok(())
    }
    async fn read_exception_status(&self, _unit_id: u8) -> HandlerResult<u8> {
        Ok(0)
    }
    async fn diagnostics(&self, _unit_id: u8, _subfn: u16, data: &[u8]) -> HandlerResult<Vec<u8>> {
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(data.to_vec())
    }
    async fn get_comm_event_counter(&self, _unit_id: u8) -> HandlerResult<(u16, u16)> {
        Ok((0, 0))
    }
    async fn report_server_id(&self, _unit_id: u8) -> HandlerResult<Vec<u8>> {
        Ok(vec![])
    }
}

#[tokio::test]
async fn close_waits_for_in_flight_workers_to_finish() {
    let finished = Arc::new(AtomicBool::new(false));
    let handler = Arc::new(SlowHandler {
        delay: Duration::from_millis(200),
        finished: Arc::clone(&finished),
    });
    let (server, addr, task) = spawn_server(handler, ServerOptions::new()).await;

    let client = Client::new(addr, ClientOptions::new());
    client.connect().await.unwrap();

    let request = tokio::spawn(async move { client.diagnostics(0x00, &[1, 2, 3]).await });

    // Give the request time to reach the worker before closing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close().await;

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("serve() should return once the in-flight worker drains")
        .unwrap()
        .unwrap();

    assert!(
        finished.load(Ordering::SeqCst),
        "serve() returned before the slow handler call actually completed"
    );
    request.await.unwrap().unwrap();
}
