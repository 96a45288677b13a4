// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Modbus TCP client session: connect/reconnect state machine,
//! the twelve typed request methods, and retry policy.

mod options;

pub use options::ClientOptions;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::codec;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::transport::Transport;

/// Where the session currently stands with respect to its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A Modbus TCP client session bound to a single peer address.
pub struct Client {
    transport: Transport,
    options: ClientOptions,
    state: Mutex<ConnectionState>,
    unit_id: AtomicU8,
    closed: AtomicBool,
    cancel: CancelToken,
    pub metrics: Metrics,
}

impl Client {
    #[must_use]
    pub fn new(addr: SocketAddr, options: ClientOptions) -> Self {
        let unit_id = options.unit_id;
        Self {
            transport: Transport::new(addr),
            options,
            state: Mutex::new(ConnectionState::Disconnected),
            unit_id: AtomicU8::new(unit_id),
            closed: AtomicBool::new(false),
            cancel: CancelToken::new(),
            metrics: Metrics::default(),
        }
    }

    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.transport.address()
    }

    #[must_use]
    pub fn unit_id(&self) -> u8 {
        self.unit_id.load(Ordering::Relaxed)
    }

    pub fn set_unit_id(&self, unit_id: u8) {
        self.unit_id.store(unit_id, Ordering::Relaxed);
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Dials the peer. Idempotent while already `Connected`.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_deadline(self.default_deadline()).await
    }

    async fn connect_with_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.check_closed()?;
        {
            let mut state = self.state.lock().await;
            if *state == ConnectionState::Connected {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        match self.transport.connect(deadline).await {
            Ok(()) => {
                *self.state.lock().await = ConnectionState::Connected;
                self.metrics.active_conns.incr();
                if let Some(on_connect) = &self.options.on_connect {
                    on_connect();
                }
                Ok(())
            }
            Err(err) => {
                *self.state.lock().await = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Terminal: closes the transport, aborts any in-progress
    /// reconnect loop, and rejects every subsequent operation with
    /// [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        if *state == ConnectionState::Connected {
            self.metrics.active_conns.decr();
        }
        *state = ConnectionState::Disconnected;
        drop(state);
        self.transport.close().await;
    }

    fn default_deadline(&self) -> Option<Instant> {
        Some(Instant::now() + self.options.timeout)
    }

    async fn handle_disconnect(&self, err: &Error) {
        let mut state = self.state.lock().await;
        if *state == ConnectionState::Connected {
            self.metrics.active_conns.decr();
        }
        *state = ConnectionState::Disconnected;
        drop(state);
        self.transport.close().await;
        if let Some(on_disconnect) = &self.options.on_disconnect {
            on_disconnect(err);
        }
    }

    /// Reconnects with exponential backoff, starting at
    /// `reconnect_backoff` and capped at `max_reconnect_time`. Honors
    /// both the caller's deadline and `close()`.
    async fn reconnect(&self, deadline: Option<Instant>) -> Result<()> {
        self.check_closed()?;
        let mut backoff = self.options.reconnect_backoff;
        loop {
            self.check_closed()?;
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.metrics.reconnections.incr();
            match self.connect_with_deadline(deadline).await {
                Ok(()) => {
                    log::info!("reconnected to {}", self.address());
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("reconnect attempt to {} failed: {err}", self.address());
                    if let Some(at) = deadline {
                        if Instant::now() >= at {
                            return Err(Error::Timeout);
                        }
                    }
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = self.cancel.cancelled() => return Err(Error::Cancelled),
                    }
                    backoff = backoff
                        .saturating_mul(2)
                        .min(self.options.max_reconnect_time);
                }
            }
        }
    }

    /// Runs the full send algorithm for one PDU: attempt budget,
    /// reconnects between attempts, response validation, metrics and
    /// retry classification.
    async fn send_pdu(&self, unit_id: u8, function_code: u8, pdu: Vec<u8>) -> Result<Vec<u8>> {
        self.check_closed()?;
        let attempts = if self.options.auto_reconnect {
            self.options.max_retries.max(1)
        } else {
            1
        };
        let mut last_err = Error::NotConnected;

        for attempt in 0..attempts {
            let deadline = self.default_deadline();
            if attempt > 0 {
                if let Err(err) = self.reconnect(deadline).await {
                    return Err(err);
                }
            }
            if !self.is_connected().await {
                last_err = Error::NotConnected;
                if self.options.auto_reconnect {
                    continue;
                }
                return Err(last_err);
            }

            let transaction_id = self.transport.next_transaction_id();
            let start = Instant::now();
            match self
                .transport
                .send(transaction_id, unit_id, pdu.clone(), deadline)
                .await
            {
                Ok((header, response_pdu)) => {
                    match validate_response(&header, &response_pdu, transaction_id, unit_id, function_code)
                    {
                        Ok(()) => {}
                        Err(err) => {
                            let is_modbus = err.as_modbus_exception().is_some();
                            self.metrics.observe(function_code, start.elapsed(), true);
                            if is_modbus {
                                return Err(err);
                            }
                            last_err = err;
                            if self.options.auto_reconnect && last_err.is_retryable() {
                                continue;
                            }
                            return Err(last_err);
                        }
                    }
                    self.metrics.observe(function_code, start.elapsed(), false);
                    return Ok(response_pdu);
                }
                Err(err) => {
                    self.handle_disconnect(&err).await;
                    self.metrics.observe(function_code, start.elapsed(), true);
                    let retryable = err.is_retryable();
                    last_err = err;
                    if self.options.auto_reconnect && retryable {
                        continue;
                    }
                    return Err(last_err);
                }
            }
        }

        Err(Error::RetriesExhausted {
            attempts,
            source: Box::new(last_err),
        })
    }
}

/// Validates a response frame against the request that produced it:
/// transaction/unit echo, exception detection, and function-code
/// agreement (high bit cleared).
fn validate_response(
    header: &crate::codec::mbap::Header,
    response_pdu: &[u8],
    transaction_id: u16,
    unit_id: u8,
    function_code: u8,
) -> Result<()> {
    if header.transaction_id != transaction_id {
        return Err(Error::Protocol(format!(
            "transaction id mismatch: expected {transaction_id}, got {}",
            header.transaction_id
        )));
    }
    if header.unit_id != unit_id {
        return Err(Error::Protocol(format!(
            "unit id mismatch: expected {unit_id}, got {}",
            header.unit_id
        )));
    }
    if let Some(exception) = codec::decode_exception(response_pdu)? {
        return Err(Error::Modbus {
            function_code: exception.function_code,
            exception_code: exception.exception_code,
        });
    }
    if response_pdu.is_empty() || response_pdu[0] != function_code {
        return Err(Error::Protocol(format!(
            "function code mismatch: expected 0x{function_code:02X}"
        )));
    }
    Ok(())
}

macro_rules! unit_variants {
    ($default_name:ident, $unit_name:ident ($($arg:ident : $ty:ty),*) -> $ret:ty, $body:expr) => {
        pub async fn $default_name(&self, $($arg: $ty),*) -> Result<$ret> {
            let unit_id = self.unit_id();
            self.$unit_name(unit_id, $($arg),*).await
        }

        pub async fn $unit_name(&self, unit_id: u8, $($arg: $ty),*) -> Result<$ret> {
            $body(self, unit_id, $($arg),*).await
        }
    };
}

impl Client {
    unit_variants!(read_coils, read_coils_as, (addr: u16, qty: u16) -> Vec<bool>,
        |this: &Self, unit_id: u8, addr: u16, qty: u16| async move {
            let pdu = codec::build_read_coils(addr, qty)?;
            let resp = this.send_pdu(unit_id, codec::FC_READ_COILS, pdu).await?;
            codec::parse_bits(&resp, qty)
        });

    unit_variants!(read_discrete_inputs, read_discrete_inputs_as, (addr: u16, qty: u16) -> Vec<bool>,
        |this: &Self, unit_id: u8, addr: u16, qty: u16| async move {
            let pdu = codec::build_read_discrete_inputs(addr, qty)?;
            let resp = this.send_pdu(unit_id, codec::FC_READ_DISCRETE_INPUTS, pdu).await?;
            codec::parse_bits(&resp, qty)
        });

    unit_variants!(read_holding_registers, read_holding_registers_as, (addr: u16, qty: u16) -> Vec<u16>,
        |this: &Self, unit_id: u8, addr: u16, qty: u16| async move {
            let pdu = codec::build_read_holding_registers(addr, qty)?;
            let resp = this.send_pdu(unit_id, codec::FC_READ_HOLDING_REGISTERS, pdu).await?;
            codec::parse_regs(&resp, qty)
        });

    unit_variants!(read_input_registers, read_input_registers_as, (addr: u16, qty: u16) -> Vec<u16>,
        |this: &Self, unit_id: u8, addr: u16, qty: u16| async move {
            let pdu = codec::build_read_input_registers(addr, qty)?;
            let resp = this.send_pdu(unit_id, codec::FC_READ_INPUT_REGISTERS, pdu).await?;
            codec::parse_regs(&resp, qty)
        });

    unit_variants!(write_single_coil, write_single_coil_as, (addr: u16, value: bool) -> (),
        |this: &Self, unit_id: u8, addr: u16, value: bool| async move {
            let pdu = codec::build_write_single_coil(addr, value);
            let resp = this.send_pdu(unit_id, codec::FC_WRITE_SINGLE_COIL, pdu.clone()).await?;
            codec::parse_write_echo(&resp, &pdu[1..])
        });

    unit_variants!(write_single_register, write_single_register_as, (addr: u16, value: u16) -> (),
        |this: &Self, unit_id: u8, addr: u16, value: u16| async move {
            let pdu = codec::build_write_single_register(addr, value);
            let resp = this.send_pdu(unit_id, codec::FC_WRITE_SINGLE_REGISTER, pdu.clone()).await?;
            codec::parse_write_echo(&resp, &pdu[1..])
        });

    unit_variants!(read_exception_status, read_exception_status_as, () -> u8,
        |this: &Self, unit_id: u8| async move {
            let pdu = codec::build_read_exception_status();
            let resp = this.send_pdu(unit_id, codec::FC_READ_EXCEPTION_STATUS, pdu).await?;
            codec::parse_read_exception_status(&resp)
        });

    unit_variants!(get_comm_event_counter, get_comm_event_counter_as, () -> (u16, u16),
        |this: &Self, unit_id: u8| async move {
            let pdu = codec::build_get_comm_event_counter();
            let resp = this.send_pdu(unit_id, codec::FC_GET_COMM_EVENT_COUNTER, pdu).await?;
            codec::parse_get_comm_event_counter(&resp)
        });

    unit_variants!(report_server_id, report_server_id_as, () -> Vec<u8>,
        |this: &Self, unit_id: u8| async move {
            let pdu = codec::build_report_server_id();
            let resp = this.send_pdu(unit_id, codec::FC_REPORT_SERVER_ID, pdu).await?;
            codec::parse_report_server_id(&resp)
        });

    pub async fn write_multiple_coils(&self, addr: u16, values: &[bool]) -> Result<()> {
        let unit_id = self.unit_id();
        self.write_multiple_coils_as(unit_id, addr, values).await
    }

    pub async fn write_multiple_coils_as(
        &self,
        unit_id: u8,
        addr: u16,
        values: &[bool],
    ) -> Result<()> {
        let pdu = codec::build_write_multiple_coils(addr, values)?;
        let qty = values.len() as u16;
        let resp = self
            .send_pdu(unit_id, codec::FC_WRITE_MULTIPLE_COILS, pdu)
            .await?;
        codec::parse_write_multiple_echo(&resp, addr, qty)
    }

    pub async fn write_multiple_registers(&self, addr: u16, values: &[u16]) -> Result<()> {
        let unit_id = self.unit_id();
        self.write_multiple_registers_as(unit_id, addr, values).await
    }

    pub async fn write_multiple_registers_as(
        &self,
        unit_id: u8,
        addr: u16,
        values: &[u16],
    ) -> Result<()> {
        let pdu = codec::build_write_multiple_registers(addr, values)?;
        let qty = values.len() as u16;
        let resp = self
            .send_pdu(unit_id, codec::FC_WRITE_MULTIPLE_REGISTERS, pdu)
            .await?;
        codec::parse_write_multiple_echo(&resp, addr, qty)
    }

    pub async fn diagnostics(&self, subfn: u16, data: &[u8]) -> Result<Vec<u8>> {
        let unit_id = self.unit_id();
        self.diagnostics_as(unit_id, subfn, data).await
    }

    pub async fn diagnostics_as(&self, unit_id: u8, subfn: u16, data: &[u8]) -> Result<Vec<u8>> {
        let pdu = codec::build_diagnostics(subfn, data);
        let resp = self
            .send_pdu(unit_id, codec::FC_DIAGNOSTICS, pdu)
            .await?;
        let (_, echoed) = codec::parse_diagnostics(&resp)?;
        Ok(echoed)
    }
}

/// Shared handle to a [`Client`], convenient for passing into the pool
/// and into callback closures.
pub type SharedClient = Arc<Client>;
