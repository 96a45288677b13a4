// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MBAP header framing: pure encode/decode over byte buffers.
//!
//! The actual socket reads/writes live in [`crate::transport`]; this
//! module only knows how to lay out and validate the 7-byte header.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 7;
pub const MAX_PDU_LEN: usize = 253;
pub const PROTOCOL_ID: u16 = 0x0000;

/// The 7-byte MBAP header, minus the length field (which is derived
/// from the PDU and not stored separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub transaction_id: u16,
    pub unit_id: u8,
}

/// A full frame: header plus PDU, ready for the wire or freshly read
/// off it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub pdu: Vec<u8>,
}

impl Frame {
    /// Serializes this frame to its wire representation.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.pdu.is_empty() || self.pdu.len() > MAX_PDU_LEN {
            return Err(Error::Protocol(format!(
                "PDU length {} outside 1..={MAX_PDU_LEN}",
                self.pdu.len()
            )));
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.pdu.len());
        let mut buf2 = [0u8; 2];
        BigEndian::write_u16(&mut buf2, self.header.transaction_id);
        out.extend_from_slice(&buf2);
        BigEndian::write_u16(&mut buf2, PROTOCOL_ID);
        out.extend_from_slice(&buf2);
        BigEndian::write_u16(&mut buf2, (self.pdu.len() + 1) as u16);
        out.extend_from_slice(&buf2);
        out.push(self.header.unit_id);
        out.extend_from_slice(&self.pdu);
        Ok(out)
    }

    /// Decodes a complete frame from a byte buffer. Rejects short,
    /// malformed, or truncated input.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Protocol("frame shorter than MBAP header".to_string()));
        }
        let (header, pdu_len) = decode_header(&buf[..HEADER_LEN])?;
        let pdu_end = HEADER_LEN + pdu_len;
        if buf.len() < pdu_end {
            return Err(Error::Protocol("frame truncated before declared length".to_string()));
        }
        Ok(Self {
            header,
            pdu: buf[HEADER_LEN..pdu_end].to_vec(),
        })
    }
}

/// Parses the 7 MBAP header bytes, returning the header and the
/// expected PDU length (`Length - 1`). Does not look at PDU bytes.
pub fn decode_header(bytes: &[u8]) -> Result<(Header, usize)> {
    debug_assert!(bytes.len() >= HEADER_LEN);
    let transaction_id = BigEndian::read_u16(&bytes[0..2]);
    let protocol_id = BigEndian::read_u16(&bytes[2..4]);
    if protocol_id != PROTOCOL_ID {
        return Err(Error::Protocol(format!(
            "invalid protocol id {protocol_id}, expected 0"
        )));
    }
    let length = usize::from(BigEndian::read_u16(&bytes[4..6]));
    if length == 0 || length > MAX_PDU_LEN + 1 {
        return Err(Error::Protocol(format!(
            "invalid MBAP length {length}, expected 1..={}",
            MAX_PDU_LEN + 1
        )));
    }
    let unit_id = bytes[6];
    Ok((
        Header {
            transaction_id,
            unit_id,
        },
        length - 1,
    ))
}

/// Writes the 7-byte MBAP header for a frame whose PDU has `pdu_len`
/// bytes.
pub fn encode_header(header: Header, pdu_len: usize) -> Result<[u8; HEADER_LEN]> {
    if pdu_len == 0 || pdu_len > MAX_PDU_LEN {
        return Err(Error::Protocol(format!(
            "PDU length {pdu_len} outside 1..={MAX_PDU_LEN}"
        )));
    }
    let mut out = [0u8; HEADER_LEN];
    BigEndian::write_u16(&mut out[0..2], header.transaction_id);
    BigEndian::write_u16(&mut out[2..4], PROTOCOL_ID);
    BigEndian::write_u16(&mut out[4..6], (pdu_len + 1) as u16);
    out[6] = header.unit_id;
    Ok(out)
}
