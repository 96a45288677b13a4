// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use async_trait::async_trait;

use crate::codec::ExceptionCode;

/// A Modbus exception a handler raises deliberately, as opposed to an
/// unexpected `Err` (which the dispatcher maps to
/// `ServerDeviceFailure`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusException(pub ExceptionCode);

impl std::fmt::Display for ModbusException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "modbus exception: {}", self.0)
    }
}

impl std::error::Error for ModbusException {}

/// Anything a handler method can fail with. `Exception` is encoded on
/// the wire as the requested function code with the high bit set;
/// anything else becomes `ServerDeviceFailure`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A handler result: data on success, or an opaque error the
/// dispatcher downgrades to a wire exception.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// The twelve data-model operations a Modbus TCP server dispatches
/// onto. Implementations must be safe to share across every
/// connection's worker without external synchronization.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn read_coils(&self, unit_id: u8, addr: u16, qty: u16) -> HandlerResult<Vec<bool>>;

    async fn read_discrete_inputs(
        &self,
        unit_id: u8,
        addr: u16,
        qty: u16,
    ) -> HandlerResult<Vec<bool>>;

    async fn write_single_coil(&self, unit_id: u8, addr: u16, value: bool) -> HandlerResult<()>;

    async fn write_multiple_coils(
        &self,
        unit_id: u8,
        addr: u16,
        values: &[bool],
    ) -> HandlerResult<()>;

    async fn read_holding_registers(
        &self,
        unit_id: u8,
        addr: u16,
        qty: u16,
    ) -> HandlerResult<Vec<u16>>;

    async fn read_input_registers(
        &self,
        unit_id: u8,
        addr: u16,
        qty: u16,
    ) -> HandlerResult<Vec<u16>>;

    async fn write_single_register(&self, unit_id: u8, addr: u16, value: u16) -> HandlerResult<()>;

    async fn write_multiple_registers(
        &self,
        unit_id: u8,
        addr: u16,
        values: &[u16],
    ) -> HandlerResult<()>;

    async fn read_exception_status(&self, unit_id: u8) -> HandlerResult<u8>;

    async fn diagnostics(&self, unit_id: u8, subfn: u16, data: &[u8]) -> HandlerResult<Vec<u8>>;

    async fn get_comm_event_counter(&self, unit_id: u8) -> HandlerResult<(u16, u16)>;

    async fn report_server_id(&self, unit_id: u8) -> HandlerResult<Vec<u8>>;
}
