// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request validation and dispatch onto a [`RequestHandler`].
//!
//! This is pure with respect to I/O: it takes a request PDU and hands
//! back a response PDU, reading/writing nothing itself.

use byteorder::{BigEndian, ByteOrder};

use crate::codec::{self, ExceptionCode, FunctionCode};

use super::handler::{HandlerError, ModbusException, RequestHandler};

const MAX_COILS_PER_READ: u16 = 2000;
const MAX_REGS_PER_READ: u16 = 125;
const MAX_REGS_PER_WRITE: u16 = 123;
const MAX_COILS_PER_WRITE: u16 = 2000;

fn exception(fc: FunctionCode, code: ExceptionCode) -> Vec<u8> {
    codec::build_exception_response(fc, code)
}

fn addr_overflows(addr: u16, qty: u16) -> bool {
    u32::from(addr) + u32::from(qty) > 0xFFFF
}

/// Downgrades a handler error to a wire exception: a deliberate
/// [`ModbusException`] keeps its code, anything else becomes
/// `ServerDeviceFailure` (and is logged, since it represents a bug or
/// unexpected backend failure rather than a protocol refusal).
fn handler_err_to_exception(fc: FunctionCode, err: HandlerError) -> Vec<u8> {
    match err.downcast::<ModbusException>() {
        Ok(modbus_err) => exception(fc, modbus_err.0),
        Err(other) => {
            log::error!("handler error on function 0x{fc:02X}: {other}");
            exception(fc, ExceptionCode::ServerDeviceFailure)
        }
    }
}

/// Dispatches one request PDU onto `handler` and returns the response
/// PDU (which may itself be an exception response). Never fails: any
/// failure becomes an exception on the wire.
pub(crate) async fn dispatch(
    handler: &dyn RequestHandler,
    unit_id: u8,
    request_pdu: &[u8],
) -> Vec<u8> {
    let Some(&fc) = request_pdu.first() else {
        return exception(0, ExceptionCode::IllegalFunction);
    };
    let body = &request_pdu[1..];

    match fc {
        codec::FC_READ_COILS | codec::FC_READ_DISCRETE_INPUTS => {
            dispatch_read_bits(handler, unit_id, fc, body).await
        }
        codec::FC_READ_HOLDING_REGISTERS | codec::FC_READ_INPUT_REGISTERS => {
            dispatch_read_regs(handler, unit_id, fc, body).await
        }
        codec::FC_WRITE_SINGLE_COIL => dispatch_write_single_coil(handler, unit_id, body).await,
        codec::FC_WRITE_SINGLE_REGISTER => {
            dispatch_write_single_register(handler, unit_id, body).await
        }
        codec::FC_WRITE_MULTIPLE_COILS => {
            dispatch_write_multiple_coils(handler, unit_id, body).await
        }
        codec::FC_WRITE_MULTIPLE_REGISTERS => {
            dispatch_write_multiple_registers(handler, unit_id, body).await
        }
        codec::FC_READ_EXCEPTION_STATUS => dispatch_read_exception_status(handler, unit_id).await,
        codec::FC_DIAGNOSTICS => dispatch_diagnostics(handler, unit_id, body).await,
        codec::FC_GET_COMM_EVENT_COUNTER => {
            dispatch_get_comm_event_counter(handler, unit_id).await
        }
        codec::FC_REPORT_SERVER_ID => dispatch_report_server_id(handler, unit_id).await,
        other => exception(other, ExceptionCode::IllegalFunction),
    }
}

fn read_addr_qty(body: &[u8]) -> Option<(u16, u16)> {
    if body.len() < 4 {
        return None;
    }
    Some((
        BigEndian::read_u16(&body[0..2]),
        BigEndian::read_u16(&body[2..4]),
    ))
}

async fn dispatch_read_bits(
    handler: &dyn RequestHandler,
    unit_id: u8,
    fc: FunctionCode,
    body: &[u8],
) -> Vec<u8> {
    let Some((addr, qty)) = read_addr_qty(body) else {
        return exception(fc, ExceptionCode::IllegalDataValue);
    };
    if qty == 0 || qty > MAX_COILS_PER_READ {
        return exception(fc, ExceptionCode::IllegalDataValue);
    }
    if addr_overflows(addr, qty) {
        return exception(fc, ExceptionCode::IllegalDataAddress);
    }
    let result = if fc == codec::FC_READ_COILS {
        handler.read_coils(unit_id, addr, qty).await
    } else {
        handler.read_discrete_inputs(unit_id, addr, qty).await
    };
    match result {
        Ok(bits) if bits.len() as u16 == qty => codec::build_bits_response(fc, &bits),
        Ok(_) => exception(fc, ExceptionCode::ServerDeviceFailure),
        Err(err) => handler_err_to_exception(fc, err),
    }
}

async fn dispatch_read_regs(
    handler: &dyn RequestHandler,
    unit_id: u8,
    fc: FunctionCode,
    body: &[u8],
) -> Vec<u8> {
    let Some((addr, qty)) = read_addr_qty(body) else {
        return exception(fc, ExceptionCode::IllegalDataValue);
    };
    if qty == 0 || qty > MAX_REGS_PER_READ {
        return exception(fc, ExceptionCode::IllegalDataValue);
    }
    if addr_overflows(addr, qty) {
        return exception(fc, ExceptionCode::IllegalDataAddress);
    }
    let result = if fc == codec::FC_READ_HOLDING_REGISTERS {
        handler.read_holding_registers(unit_id, addr, qty).await
    } else {
        handler.read_input_registers(unit_id, addr, qty).await
    };
    match result {
        Ok(regs) if regs.len() as u16 == qty => codec::build_regs_response(fc, &regs),
        Ok(_) => exception(fc, ExceptionCode::ServerDeviceFailure),
        Err(err) => handler_err_to_exception(fc, err),
    }
}

async fn dispatch_write_single_coil(
    handler: &dyn RequestHandler,
    unit_id: u8,
    body: &[u8],
) -> Vec<u8> {
    let fc = codec::FC_WRITE_SINGLE_COIL;
    if body.len() != 4 {
        return exception(fc, ExceptionCode::IllegalDataValue);
    }
    let addr = BigEndian::read_u16(&body[0..2]);
    let raw_value = BigEndian::read_u16(&body[2..4]);
    let value = match codec::coil_from_word(raw_value) {
        Ok(v) => v,
        Err(_) => return exception(fc, ExceptionCode::IllegalDataValue),
    };
    match handler.write_single_coil(unit_id, addr, value).await {
        Ok(()) => {
            let mut response = vec![fc];
            response.extend_from_slice(body);
            response
        }
        Err(err) => handler_err_to_exception(fc, err),
    }
}

async fn dispatch_write_single_register(
    handler: &dyn RequestHandler,
    unit_id: u8,
    body: &[u8],
) -> Vec<u8> {
    let fc = codec::FC_WRITE_SINGLE_REGISTER;
    if body.len() != 4 {
        return exception(fc, ExceptionCode::IllegalDataValue);
    }
    let addr = BigEndian::read_u16(&body[0..2]);
    let value = BigEndian::read_u16(&body[2..4]);
    match handler.write_single_register(unit_id, addr, value).await {
        Ok(()) => {
            let mut response = vec![fc];
            response.extend_from_slice(body);
            response
        }
        Err(err) => handler_err_to_exception(fc, err),
    }
}

async fn dispatch_write_multiple_coils(
    handler: &dyn RequestHandler,
    unit_id: u8,
    body: &[u8],
) -> Vec<u8> {
    let fc = codec::FC_WRITE_MULTIPLE_COILS;
    let Some((addr, qty)) = read_addr_qty(body) else {
        return exception(fc, ExceptionCode::IllegalDataValue);
    };
    if qty == 0 || qty > MAX_COILS_PER_WRITE {
        return exception(fc, ExceptionCode::IllegalDataValue);
    }
    if addr_overflows(addr, qty) {
        return exception(fc, ExceptionCode::IllegalDataAddress);
    }
    let Some(&byte_count) = body.get(4) else {
        return exception(fc, ExceptionCode::IllegalDataValue);
    };
    let expected_bytes = usize::from((qty + 7) / 8);
    if usize::from(byte_count) != expected_bytes || body.len() < 5 + expected_bytes {
        return exception(fc, ExceptionCode::IllegalDataValue);
    }
    let values = codec::unpack_bits(&body[5..5 + expected_bytes], qty);
    match handler.write_multiple_coils(unit_id, addr, &values).await {
        Ok(()) => codec::build_write_multiple_response(fc, addr, qty),
        Err(err) => handler_err_to_exception(fc, err),
    }
}

async fn dispatch_write_multiple_registers(
    handler: &dyn RequestHandler,
    unit_id: u8,
    body: &[u8],
) -> Vec<u8> {
    let fc = codec::FC_WRITE_MULTIPLE_REGISTERS;
    let Some((addr, qty)) = read_addr_qty(body) else {
        return exception(fc, ExceptionCode::IllegalDataValue);
    };
    if qty == 0 || qty > MAX_REGS_PER_WRITE {
        return exception(fc, ExceptionCode::IllegalDataValue);
    }
    if addr_overflows(addr, qty) {
        return exception(fc, ExceptionCode::IllegalDataAddress);
    }
    let Some(&byte_count) = body.get(4) else {
        return exception(fc, ExceptionCode::IllegalDataValue);
    };
    let expected_bytes = usize::from(qty) * 2;
    if usize::from(byte_count) != expected_bytes || body.len() < 5 + expected_bytes {
        return exception(fc, ExceptionCode::IllegalDataValue);
    }
    let regs_bytes = &body[5..5 + expected_bytes];
    let values: Vec<u16> = (0..usize::from(qty))
        .map(|i| BigEndian::read_u16(&regs_bytes[i * 2..i * 2 + 2]))
        .collect();
    match handler
        .write_multiple_registers(unit_id, addr, &values)
        .await
    {
        Ok(()) => codec::build_write_multiple_response(fc, addr, qty),
        Err(err) => handler_err_to_exception(fc, err),
    }
}

async fn dispatch_read_exception_status(handler: &dyn RequestHandler, unit_id: u8) -> Vec<u8> {
    let fc = codec::FC_READ_EXCEPTION_STATUS;
    match handler.read_exception_status(unit_id).await {
        Ok(status) => vec![fc, status],
        Err(err) => handler_err_to_exception(fc, err),
    }
}

async fn dispatch_diagnostics(handler: &dyn RequestHandler, unit_id: u8, body: &[u8]) -> Vec<u8> {
    let fc = codec::FC_DIAGNOSTICS;
    if body.len() < 2 {
        return exception(fc, ExceptionCode::IllegalDataValue);
    }
    let subfn = BigEndian::read_u16(&body[0..2]);
    let data = &body[2..];
    match handler.diagnostics(unit_id, subfn, data).await {
        Ok(echoed) => codec::build_diagnostics(subfn, &echoed),
        Err(err) => handler_err_to_exception(fc, err),
    }
}

async fn dispatch_get_comm_event_counter(handler: &dyn RequestHandler, unit_id: u8) -> Vec<u8> {
    let fc = codec::FC_GET_COMM_EVENT_COUNTER;
    match handler.get_comm_event_counter(unit_id).await {
        Ok((status, event_count)) => {
            let mut pdu = vec![fc];
            let mut buf = [0u8; 2];
            BigEndian::write_u16(&mut buf, status);
            pdu.extend_from_slice(&buf);
            BigEndian::write_u16(&mut buf, event_count);
            pdu.extend_from_slice(&buf);
            pdu
        }
        Err(err) => handler_err_to_exception(fc, err),
    }
}

async fn dispatch_report_server_id(handler: &dyn RequestHandler, unit_id: u8) -> Vec<u8> {
    let fc = codec::FC_REPORT_SERVER_ID;
    match handler.report_server_id(unit_id).await {
        Ok(data) => codec::report_server_id_response(&data),
        Err(err) => handler_err_to_exception(fc, err),
    }
}
