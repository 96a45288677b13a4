// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An in-memory [`RequestHandler`] fixture for exercising the server
//! and client against each other without real hardware. Not part of
//! the public API: tests only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use modbus_tcp_stack::prelude::*;
use modbus_tcp_stack::server::HandlerResult;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Binds an ephemeral port, spawns `server.serve(..)` on it, and
/// returns the server handle, its address and the serve task so tests
/// can await shutdown.
pub async fn spawn_server(
    handler: Arc<dyn RequestHandler>,
    options: ServerOptions,
) -> (Arc<Server>, SocketAddr, JoinHandle<modbus_tcp_stack::Result<()>>) {
    let server = Server::new(handler, options);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task_server = Arc::clone(&server);
    let handle = tokio::spawn(async move { task_server.serve(listener).await });
    (server, addr, handle)
}

struct UnitMemory {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
}

impl Default for UnitMemory {
    fn default() -> Self {
        Self {
            coils: vec![false; 65536],
            discrete_inputs: vec![false; 65536],
            holding_registers: vec![0; 65536],
            input_registers: vec![0; 65536],
        }
    }
}

/// A data-model backend that keeps per-unit register/coil banks in
/// plain `Vec`s behind a single lock. Exercises dispatch and wire
/// encoding, not a realistic device simulator.
pub struct MemoryHandler {
    units: Mutex<HashMap<u8, UnitMemory>>,
    report_server_id: Mutex<Vec<u8>>,
}

impl MemoryHandler {
    pub fn new() -> Self {
        Self {
            units: Mutex::new(HashMap::new()),
            report_server_id: Mutex::new(vec![0x01, 0xFF]),
        }
    }

    pub async fn set_coils(&self, unit_id: u8, addr: u16, values: &[bool]) {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        let start = usize::from(addr);
        mem.coils[start..start + values.len()].copy_from_slice(values);
    }

    pub async fn set_holding_registers(&self, unit_id: u8, addr: u16, values: &[u16]) {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        let start = usize::from(addr);
        mem.holding_registers[start..start + values.len()].copy_from_slice(values);
    }

    pub async fn set_input_registers(&self, unit_id: u8, addr: u16, values: &[u16]) {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        let start = usize::from(addr);
        mem.input_registers[start..start + values.len()].copy_from_slice(values);
    }

    /// Overrides the payload `report_server_id` answers with, so tests
    /// can exercise the server's >251-byte truncation.
    pub async fn set_report_server_id_payload(&self, data: Vec<u8>) {
        *self.report_server_id.lock().await = data;
    }
}

impl Default for MemoryHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestHandler for MemoryHandler {
    async fn read_coils(&self, unit_id: u8, addr: u16, qty: u16) -> HandlerResult<Vec<bool>> {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        let start = usize::from(addr);
        Ok(mem.coils[start..start + usize::from(qty)].to_vec())
    }

    async fn read_discrete_inputs(
        &self,
        unit_id: u8,
        addr: u16,
        qty: u16,
    ) -> HandlerResult<Vec<bool>> {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        let start = usize::from(addr);
        Ok(mem.discrete_inputs[start..start + usize::from(qty)].to_vec())
    }

    async fn write_single_coil(&self, unit_id: u8, addr: u16, value: bool) -> HandlerResult<()> {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        mem.coils[usize::from(addr)] = value;
        Ok(())
    }

    async fn write_multiple_coils(
        &self,
        unit_id: u8,
        addr: u16,
        values: &[bool],
    ) -> HandlerResult<()> {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        let start = usize::from(addr);
        mem.coils[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    async fn read_holding_registers(
        &self,
        unit_id: u8,
        addr: u16,
        qty: u16,
    ) -> HandlerResult<Vec<u16>> {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        let start = usize::from(addr);
        Ok(mem.holding_registers[start..start + usize::from(qty)].to_vec())
    }

    async fn read_input_registers(
        &self,
        unit_id: u8,
        addr: u16,
        qty: u16,
    ) -> HandlerResult<Vec<u16>> {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        let start = usize::from(addr);
        Ok(mem.input_registers[start..start + usize::from(qty)].to_vec())
    }

    async fn write_single_register(
        &self,
        unit_id: u8,
        addr: u16,
        value: u16,
    ) -> HandlerResult<()> {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        mem.holding_registers[usize::from(addr)] = value;
        Ok(())
    }

    async fn write_multiple_registers(
        &self,
        unit_id: u8,
        addr: u16,
        values: &[u16],
    ) -> HandlerResult<()> {
        let mut units = self.units.lock().await;
        let mem = units.entry(unit_id).or_default();
        let start = usize::from(addr);
        mem.holding_registers[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    async fn read_exception_status(&self, _unit_id: u8) -> HandlerResult<u8> {
        Ok(0)
    }

    async fn diagnostics(&self, _unit_id: u8, _subfn: u16, data: &[u8]) -> HandlerResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    async fn get_comm_event_counter(&self, _unit_id: u8) -> HandlerResult<(u16, u16)> {
        Ok((0, 0))
    }

    async fn report_server_id(&self, _unit_id: u8) -> HandlerResult<Vec<u8>> {
        Ok(self.report_server_id.lock().await.clone())
    }
}
