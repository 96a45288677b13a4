// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

mod support;

use std::sync::Arc;
use std::time::Duration;

use modbus_tcp_stack::prelude::*;
use support::{spawn_server, MemoryHandler};

#[tokio::test]
async fn read_coils_round_trip() {
    let handler = Arc::new(MemoryHandler::new());
    handler
        .set_coils(1, 0, &[true, false, true, false, false, false, false, false])
        .await;
    let (server, addr, _task) = spawn_server(handler, ServerOptions::new()).await;

    let client = Client::new(addr, ClientOptions::new().with_unit_id(1));
    client.connect().await.unwrap();
    let bits = client.read_coils(0, 8).await.unwrap();
    assert_eq!(
        bits,
        vec![true, false, true, false, false, false, false, false]
    );

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn read_holding_registers_round_trip() {
    let handler = Arc::new(MemoryHandler::new());
    handler
        .set_holding_registers(1, 0, &[1234, 5678, 9012])
        .await;
    let (server, addr, _task) = spawn_server(handler, ServerOptions::new()).await;

    let client = Client::new(addr, ClientOptions::new().with_unit_id(1));
    client.connect().await.unwrap();
    let regs = client.read_holding_registers(0, 3).await.unwrap();
    assert_eq!(regs, vec![1234, 5678, 9012]);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn write_single_coil_is_reflected_back() {
    let handler = Arc::new(MemoryHandler::new());
    let (server, addr, _task) = spawn_server(handler, ServerOptions::new()).await;

    let client = Client::new(addr, ClientOptions::new().with_unit_id(1));
    client.connect().await.unwrap();
    client.write_single_coil(5, true).await.unwrap();
    let bits = client.read_coils(0, 8).await.unwrap();
    assert!(bits[5]);
    assert!(!bits[0]);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn illegal_data_address_is_not_retried() {
    let handler = Arc::new(MemoryHandler::new());
    let (server, addr, _task) = spawn_server(handler, ServerOptions::new()).await;

    let client = Client::new(
        addr,
        ClientOptions::new()
            .with_unit_id(1)
            .with_auto_reconnect(true)
            .with_max_retries(3),
    );
    client.connect().await.unwrap();

    let err = client
        .read_holding_registers(65535, 2)
        .await
        .expect_err("address+quantity overflows 65536 and must be rejected");
    let (_, code) = err
        .as_modbus_exception()
        .expect("server should answer with a Modbus exception, not a transport error");
    assert_eq!(code, ExceptionCode::IllegalDataAddress);
    assert_eq!(server.metrics.requests_total.get(), 1);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn zero_and_over_max_quantities_are_rejected_before_any_io() {
    let handler = Arc::new(MemoryHandler::new());
    let (server, addr, _task) = spawn_server(handler, ServerOptions::new()).await;

    let client = Client::new(addr, ClientOptions::new().with_unit_id(1));
    client.connect().await.unwrap();

    assert!(client.read_coils(0, 0).await.is_err());
    assert!(client.read_holding_registers(0, 126).await.is_err());
    assert_eq!(
        server.metrics.requests_total.get(),
        0,
        "malformed requests must never reach the wire"
    );

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn write_multiple_registers_over_limit_is_rejected_client_side() {
    let handler = Arc::new(MemoryHandler::new());
    let (server, addr, _task) = spawn_server(handler, ServerOptions::new()).await;

    let client = Client::new(addr, ClientOptions::new().with_unit_id(1));
    client.connect().await.unwrap();

    let values = vec![0u16; 124];
    assert!(client.write_multiple_registers(0, &values).await.is_err());
    assert_eq!(server.metrics.requests_total.get(), 0);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn diagnostics_echoes_payload_verbatim() {
    let handler = Arc::new(MemoryHandler::new());
    let (server, addr, _task) = spawn_server(handler, ServerOptions::new()).await;

    let client = Client::new(addr, ClientOptions::new().with_unit_id(1));
    client.connect().await.unwrap();

    let echoed = client.diagnostics(0x00, &[0xAB, 0xCD, 0xEF]).await.unwrap();
    assert_eq!(echoed, vec![0xAB, 0xCD, 0xEF]);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn report_server_id_truncates_past_251_bytes() {
    let handler = Arc::new(MemoryHandler::new());
    handler.set_report_server_id_payload(vec![7u8; 300]).await;
    let (server, addr, _task) = spawn_server(handler, ServerOptions::new()).await;

    let client = Client::new(addr, ClientOptions::new().with_unit_id(1));
    client.connect().await.unwrap();

    let data = client.report_server_id().await.unwrap();
    assert_eq!(data.len(), 251);
    assert!(data.iter().all(|&b| b == 7));

    client.close().await;
    server.close().await;
}

struct RawCoilHandler;

#[async_trait::async_trait]
impl RequestHandler for RawCoilHandler {
    async fn read_coils(
        &self,
        _unit_id: u8,
        _addr: u16,
        _qty: u16,
    ) -> modbus_tcp_stack::server::HandlerResult<Vec<bool>> {
        Ok(vec![])
    }
    async fn read_discrete_inputs(
        &self,
        _unit_id: u8,
        _addr: u16,
        _qty: u16,
    ) -> modbus_tcp_stack::server::HandlerResult<Vec<bool>> {
        Ok(vec![])
    }
    async fn write_single_coil(
        &self,
        _unit_id: u8,
        _addr: u16,
        _value: bool,
    ) -> modbus_tcp_stack::server::HandlerResult<()> {
        Ok(())
    }
    async fn write_multiple_coils(
        &self,
        _unit_id: u8,
        _addr: u16,
        _values: &[bool],
    ) -> modbus_tcp_stack::server::HandlerResult<()> {
        Ok(())
    }
    async fn read_holding_registers(
        &self,
        _unit_id: u8,
        _addr: u16,
        _qty: u16,
    ) -> modbus_tcp_stack::server::HandlerResult<Vec<u16>> {
        Ok(vec![])
    }
    async fn read_input_registers(
        &self,
        _unit_id: u8,
        _addr: u16,
        _qty: u16,
    ) -> modbus_tcp_stack::server::HandlerResult<Vec<u16>> {
        Ok(vec![])
    }
    async fn write_single_register(
        &self,
        _unit_id: u8,
        _addr: u16,
        _value: u16,
    ) -> modbus_tcp_stack::server::HandlerResult<()> {
        Ok(())
    }
    async fn write_multiple_registers(
        &self,
        _unit_id: u8,
        _addr: u16,
        _values: &[u16],
    ) -> modbus_tcp_stack::server::HandlerResult<()> {
        Ok(())
    }
    async fn read_exception_status(&self, _unit_id: u8) -> modbus_tcp_stack::server::HandlerResult<u8> {
        Ok(0)
    }
    async fn diagnostics(
        &self,
        _unit_id: u8,
        _subfn: u16,
        data: &[u8],
    ) -> modbus_tcp_stack::server::HandlerResult<Vec<u8>> {
        Ok(data.to_vec())
    }
    async fn get_comm_event_counter(
        &self,
        _unit_id: u8,
    ) -> modbus_tcp_stack::server::HandlerResult<(u16, u16)> {
        Ok((0, 0))
    }
    async fn report_server_id(&self, _unit_id: u8) -> modbus_tcp_stack::server::HandlerResult<Vec<u8>> {
        Ok(vec![])
    }
}

/// A real Modbus client never sends a coil word other than
/// `0x0000`/`0xFF00`, so this drives the wire directly to exercise the
/// server's own validation of a malformed write-single-coil request.
#[tokio::test]
async fn server_rejects_bad_coil_value_on_the_wire() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let (server, addr, _task) = spawn_server(Arc::new(RawCoilHandler), ServerOptions::new()).await;

    let mut stream = tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(addr))
        .await
        .unwrap()
        .unwrap();

    // MBAP header (transaction 1, length 6, unit 1) + FC 0x05 + addr 0x0005
    // + coil value 0x1234, which is neither 0x0000 nor 0xFF00.
    let mut frame = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01];
    frame.extend_from_slice(&[0x05, 0x00, 0x05, 0x12, 0x34]);

    stream.write_all(&frame).await.unwrap();

    let mut response = [0u8; 9];
    tokio::time::timeout(Duration::from_secs(1), stream.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response[7], 0x05 | 0x80);
    assert_eq!(response[8], 0x03); // IllegalDataValue

    drop(stream);
    server.close().await;
}
