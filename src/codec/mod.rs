// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pure byte-in / byte-out transformations for Modbus PDUs.
//!
//! Nothing in this module touches I/O: encoders build owned [`Vec<u8>`]
//! PDUs and parsers read back out of response slices. The MBAP framing
//! that wraps a PDU for the wire lives in [`mbap`].

pub mod mbap;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// A Modbus function code, as carried in the first byte of a PDU.
pub type FunctionCode = u8;

pub const FC_READ_COILS: FunctionCode = 0x01;
pub const FC_READ_DISCRETE_INPUTS: FunctionCode = 0x02;
pub const FC_READ_HOLDING_REGISTERS: FunctionCode = 0x03;
pub const FC_READ_INPUT_REGISTERS: FunctionCode = 0x04;
pub const FC_WRITE_SINGLE_COIL: FunctionCode = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: FunctionCode = 0x06;
pub const FC_READ_EXCEPTION_STATUS: FunctionCode = 0x07;
pub const FC_DIAGNOSTICS: FunctionCode = 0x08;
pub const FC_GET_COMM_EVENT_COUNTER: FunctionCode = 0x0B;
pub const FC_WRITE_MULTIPLE_COILS: FunctionCode = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: FunctionCode = 0x10;
pub const FC_REPORT_SERVER_ID: FunctionCode = 0x11;

/// High bit that marks a response PDU as an exception.
pub const EXCEPTION_BIT: u8 = 0x80;

const MAX_COILS_PER_READ: u16 = 2000;
const MAX_REGS_PER_READ: u16 = 125;
const MAX_REGS_PER_WRITE: u16 = 123;
const MAX_COILS_PER_WRITE: u16 = 2000;
const MAX_REPORT_SERVER_ID_LEN: usize = 251;

/// A Modbus exception reason, as carried in the second byte of an
/// exception response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetDeviceFailedToRespond,
    /// A code outside the canonical set, preserved verbatim rather
    /// than normalized away.
    Other(u8),
}

impl ExceptionCode {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetDeviceFailedToRespond => 0x0B,
            Self::Other(code) => code,
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetDeviceFailedToRespond,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerDeviceFailure => "server device failure",
            Self::Acknowledge => "acknowledge",
            Self::ServerDeviceBusy => "server device busy",
            Self::MemoryParityError => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetDeviceFailedToRespond => "gateway target device failed to respond",
            Self::Other(code) => return write!(f, "exception 0x{code:02X}"),
        };
        f.write_str(text)
    }
}

/// A decoded exception response: the original function code (high bit
/// cleared) and the reported reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionResponse {
    pub function_code: FunctionCode,
    pub exception_code: ExceptionCode,
}

fn check_quantity(qty: u16, max: u16) -> Result<()> {
    if qty == 0 || qty > max {
        return Err(Error::InvalidRequest(format!(
            "quantity {qty} out of range 1..={max}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------
//
// Quantity is validated client-side; address-range overflow (addr + qty
// > 65536) is deliberately left to the server, which reports it as an
// IllegalDataAddress exception on the wire rather than a local error.

pub fn build_read_coils(addr: u16, qty: u16) -> Result<Vec<u8>> {
    check_quantity(qty, MAX_COILS_PER_READ)?;
    Ok(encode_addr_qty(FC_READ_COILS, addr, qty))
}

pub fn build_read_discrete_inputs(addr: u16, qty: u16) -> Result<Vec<u8>> {
    check_quantity(qty, MAX_COILS_PER_READ)?;
    Ok(encode_addr_qty(FC_READ_DISCRETE_INPUTS, addr, qty))
}

pub fn build_read_holding_registers(addr: u16, qty: u16) -> Result<Vec<u8>> {
    check_quantity(qty, MAX_REGS_PER_READ)?;
    Ok(encode_addr_qty(FC_READ_HOLDING_REGISTERS, addr, qty))
}

pub fn build_read_input_registers(addr: u16, qty: u16) -> Result<Vec<u8>> {
    check_quantity(qty, MAX_REGS_PER_READ)?;
    Ok(encode_addr_qty(FC_READ_INPUT_REGISTERS, addr, qty))
}

pub fn build_write_single_coil(addr: u16, value: bool) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FC_WRITE_SINGLE_COIL);
    put_u16(&mut pdu, addr);
    put_u16(&mut pdu, coil_word(value));
    pdu
}

pub fn build_write_single_register(addr: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FC_WRITE_SINGLE_REGISTER);
    put_u16(&mut pdu, addr);
    put_u16(&mut pdu, value);
    pdu
}

pub fn build_write_multiple_coils(addr: u16, values: &[bool]) -> Result<Vec<u8>> {
    let len = u16::try_from(values.len())
        .map_err(|_| Error::InvalidRequest("too many coils".to_string()))?;
    check_quantity(len, MAX_COILS_PER_WRITE)?;
    let packed = pack_bits(values);
    let mut pdu = Vec::with_capacity(6 + packed.len());
    pdu.push(FC_WRITE_MULTIPLE_COILS);
    put_u16(&mut pdu, addr);
    put_u16(&mut pdu, len);
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(&packed);
    Ok(pdu)
}

pub fn build_write_multiple_registers(addr: u16, values: &[u16]) -> Result<Vec<u8>> {
    let len = u16::try_from(values.len())
        .map_err(|_| Error::InvalidRequest("too many registers".to_string()))?;
    check_quantity(len, MAX_REGS_PER_WRITE)?;
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(FC_WRITE_MULTIPLE_REGISTERS);
    put_u16(&mut pdu, addr);
    put_u16(&mut pdu, len);
    pdu.push((values.len() * 2) as u8);
    for &value in values {
        put_u16(&mut pdu, value);
    }
    Ok(pdu)
}

pub fn build_read_exception_status() -> Vec<u8> {
    vec![FC_READ_EXCEPTION_STATUS]
}

pub fn build_get_comm_event_counter() -> Vec<u8> {
    vec![FC_GET_COMM_EVENT_COUNTER]
}

pub fn build_report_server_id() -> Vec<u8> {
    vec![FC_REPORT_SERVER_ID]
}

pub fn build_diagnostics(subfn: u16, data: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(3 + data.len());
    pdu.push(FC_DIAGNOSTICS);
    put_u16(&mut pdu, subfn);
    pdu.extend_from_slice(data);
    pdu
}

// ---------------------------------------------------------------------
// Exception detection
// ---------------------------------------------------------------------

/// Checks whether a response PDU is an exception and, if so, decodes it.
/// Must be called before any function-specific parsing.
pub fn decode_exception(pdu: &[u8]) -> Result<Option<ExceptionResponse>> {
    let byte0 = *pdu
        .first()
        .ok_or_else(|| Error::Protocol("empty PDU".to_string()))?;
    if byte0 & EXCEPTION_BIT == 0 {
        return Ok(None);
    }
    let exception_code = *pdu
        .get(1)
        .ok_or_else(|| Error::Protocol("truncated exception response".to_string()))?;
    Ok(Some(ExceptionResponse {
        function_code: byte0 & !EXCEPTION_BIT,
        exception_code: ExceptionCode::from(exception_code),
    }))
}

// ---------------------------------------------------------------------
// Response encoders (server side)
// ---------------------------------------------------------------------

/// Builds a `[fc, byte_count, packed_bits…]` response for a bits read
/// (FC 0x01/0x02).
pub fn build_bits_response(fc: FunctionCode, bits: &[bool]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(2 + bits.len() / 8 + 1);
    pdu.push(fc);
    let packed = pack_bits(bits);
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(&packed);
    pdu
}

/// Builds a `[fc, byte_count, regs_be…]` response for a registers read
/// (FC 0x03/0x04).
pub fn build_regs_response(fc: FunctionCode, regs: &[u16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(2 + regs.len() * 2);
    pdu.push(fc);
    pdu.push((regs.len() * 2) as u8);
    for &reg in regs {
        put_u16(&mut pdu, reg);
    }
    pdu
}

/// Builds the exception response `[fc | 0x80, exception_code]`.
pub fn build_exception_response(fc: FunctionCode, exception_code: ExceptionCode) -> Vec<u8> {
    vec![fc | EXCEPTION_BIT, exception_code.code()]
}

// ---------------------------------------------------------------------
// Response parsers
// ---------------------------------------------------------------------

pub fn parse_bits(pdu: &[u8], qty: u16) -> Result<Vec<bool>> {
    let body = expect_fc_and_body(pdu)?;
    let byte_count = *body
        .first()
        .ok_or_else(|| Error::Protocol("missing byte count".to_string()))?;
    let expected = usize::from((qty + 7) / 8);
    if usize::from(byte_count) != expected {
        return Err(Error::Protocol(format!(
            "byte count {byte_count} does not match expected {expected}"
        )));
    }
    let bits = &body[1..];
    if bits.len() < expected {
        return Err(Error::Protocol("truncated bit payload".to_string()));
    }
    Ok(unpack_bits(bits, qty))
}

pub fn parse_regs(pdu: &[u8], qty: u16) -> Result<Vec<u16>> {
    let body = expect_fc_and_body(pdu)?;
    let byte_count = *body
        .first()
        .ok_or_else(|| Error::Protocol("missing byte count".to_string()))?;
    let expected = usize::from(qty) * 2;
    if usize::from(byte_count) != expected {
        return Err(Error::Protocol(format!(
            "byte count {byte_count} does not match expected {expected}"
        )));
    }
    let data = &body[1..];
    if data.len() < expected {
        return Err(Error::Protocol("truncated register payload".to_string()));
    }
    Ok((0..qty as usize)
        .map(|i| BigEndian::read_u16(&data[i * 2..i * 2 + 2]))
        .collect())
}

/// Validates that a write-single-coil/register response echoes the
/// request body exactly.
pub fn parse_write_echo(pdu: &[u8], request_body: &[u8]) -> Result<()> {
    let body = expect_fc_and_body(pdu)?;
    if body != request_body {
        return Err(Error::Protocol(
            "write acknowledgement does not echo the request".to_string(),
        ));
    }
    Ok(())
}

/// Validates a multi-write response (`[addr, qty]`) against the request.
pub fn parse_write_multiple_echo(pdu: &[u8], addr: u16, qty: u16) -> Result<()> {
    let body = expect_fc_and_body(pdu)?;
    if body.len() != 4 {
        return Err(Error::Protocol("malformed multi-write response".to_string()));
    }
    let resp_addr = BigEndian::read_u16(&body[0..2]);
    let resp_qty = BigEndian::read_u16(&body[2..4]);
    if resp_addr != addr || resp_qty != qty {
        return Err(Error::Protocol(
            "multi-write response does not echo address/quantity".to_string(),
        ));
    }
    Ok(())
}

pub fn parse_read_exception_status(pdu: &[u8]) -> Result<u8> {
    let body = expect_fc_and_body(pdu)?;
    body.first().copied().ok_or_else(|| {
        Error::Protocol("missing exception status byte".to_string())
    })
}

pub fn parse_get_comm_event_counter(pdu: &[u8]) -> Result<(u16, u16)> {
    let body = expect_fc_and_body(pdu)?;
    if body.len() != 4 {
        return Err(Error::Protocol(
            "malformed comm-event-counter response".to_string(),
        ));
    }
    Ok((
        BigEndian::read_u16(&body[0..2]),
        BigEndian::read_u16(&body[2..4]),
    ))
}

pub fn parse_report_server_id(pdu: &[u8]) -> Result<Vec<u8>> {
    let body = expect_fc_and_body(pdu)?;
    let byte_count = *body
        .first()
        .ok_or_else(|| Error::Protocol("missing byte count".to_string()))?;
    let data = &body[1..];
    if data.len() < usize::from(byte_count) {
        return Err(Error::Protocol("truncated report-server-id payload".to_string()));
    }
    Ok(data[..usize::from(byte_count)].to_vec())
}

pub fn parse_diagnostics(pdu: &[u8]) -> Result<(u16, Vec<u8>)> {
    let body = expect_fc_and_body(pdu)?;
    if body.len() < 2 {
        return Err(Error::Protocol("malformed diagnostics response".to_string()));
    }
    Ok((BigEndian::read_u16(&body[0..2]), body[2..].to_vec()))
}

fn expect_fc_and_body(pdu: &[u8]) -> Result<&[u8]> {
    if pdu.is_empty() {
        return Err(Error::Protocol("empty PDU".to_string()));
    }
    Ok(&pdu[1..])
}

// ---------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------

fn encode_addr_qty(fc: FunctionCode, addr: u16, qty: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(fc);
    put_u16(&mut pdu, addr);
    put_u16(&mut pdu, qty);
    pdu
}

/// Builds a multi-write acknowledgement `[fc, addr, qty]` (FC 0x0F/0x10
/// response), used by the server-side dispatcher to echo back what it
/// wrote.
pub fn build_write_multiple_response(fc: FunctionCode, addr: u16, qty: u16) -> Vec<u8> {
    encode_addr_qty(fc, addr, qty)
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    let mut bytes = [0u8; 2];
    BigEndian::write_u16(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

fn coil_word(value: bool) -> u16 {
    if value {
        0xFF00
    } else {
        0x0000
    }
}

/// Converts a coil word (`0xFF00`/`0x0000`) on the wire to a `bool`.
pub fn coil_from_word(word: u16) -> Result<bool> {
    match word {
        0xFF00 => Ok(true),
        0x0000 => Ok(false),
        other => Err(Error::InvalidRequest(format!(
            "invalid coil value 0x{other:04X}, expected 0x0000 or 0xFF00"
        ))),
    }
}

pub(crate) const fn packed_len(bit_count: u16) -> u16 {
    (bit_count + 7) / 8
}

/// Packs a boolean sequence into little-endian-within-byte bits: bit `i`
/// of the sequence is bit `i % 8` of byte `i / 8`.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; usize::from(packed_len(bits.len() as u16))];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpacks exactly `qty` bits from `bytes`, mirroring [`pack_bits`].
pub fn unpack_bits(bytes: &[u8], qty: u16) -> Vec<bool> {
    (0..usize::from(qty))
        .map(|i| (bytes[i / 8] >> (i % 8)) & 0b1 != 0)
        .collect()
}

pub fn report_server_id_response(data: &[u8]) -> Vec<u8> {
    let truncated = if data.len() > MAX_REPORT_SERVER_ID_LEN {
        &data[..MAX_REPORT_SERVER_ID_LEN]
    } else {
        data
    };
    let mut pdu = Vec::with_capacity(2 + truncated.len());
    pdu.push(FC_REPORT_SERVER_ID);
    pdu.push(truncated.len() as u8);
    pdu.extend_from_slice(truncated);
    pdu
}
