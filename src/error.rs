// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Library error type

use crate::codec::ExceptionCode;

/// A specialized [`Result`] type for Modbus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the client, server and connection pool.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An option bundle was constructed with an invalid value.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A client operation was attempted while disconnected.
    #[error("not connected")]
    NotConnected,

    /// The client or pool has been closed and cannot be reused.
    #[error("connection closed")]
    ConnectionClosed,

    /// Dial, read or write failure on the underlying socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The MBAP header or PDU body violated the wire format.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer answered with a Modbus exception response.
    #[error("modbus exception on function 0x{function_code:02X}: {exception_code}")]
    Modbus {
        /// The function code the request was sent with (high bit clear).
        function_code: u8,
        /// The exception reason reported by the peer.
        exception_code: ExceptionCode,
    },

    /// A caller-supplied quantity or address was out of protocol range.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The caller's deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled (e.g. the client or pool was closed).
    #[error("cancelled")]
    Cancelled,

    /// An auto-reconnecting client exhausted its retry budget.
    #[error("retries exhausted after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: Box<Error>,
    },

    /// The connection pool has been closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// A pool acquire timed out while waiting for a connection.
    #[error("connection pool exhausted")]
    PoolTimeout,
}

impl Error {
    /// Returns `Some((function_code, exception_code))` if this is a
    /// [`Error::Modbus`], regardless of which function raised it.
    #[must_use]
    pub fn as_modbus_exception(&self) -> Option<(u8, ExceptionCode)> {
        match self {
            Self::Modbus {
                function_code,
                exception_code,
            } => Some((*function_code, *exception_code)),
            _ => None,
        }
    }

    /// Returns `true` if this error wraps an exhausted retry budget.
    #[must_use]
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// Returns `true` for errors that are safe to retry under an
    /// auto-reconnecting client: transport I/O failures and protocol
    /// violations. Modbus exceptions, timeouts, cancellation, and
    /// configuration/closed errors are never retryable.
    #[must_use]
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Protocol(_))
    }
}
