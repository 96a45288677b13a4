// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A single TCP connection with request/response semantics.
//!
//! The transport knows nothing about PDUs: it moves whole MBAP frames
//! and leaves interpretation to [`crate::client`] and [`crate::server`].
//! At most one transaction is ever in flight, enforced by holding the
//! connection's mutex for the full round trip.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout_at;

use crate::codec::mbap::{self, Frame, Header, HEADER_LEN, MAX_PDU_LEN};
use crate::error::{Error, Result};

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

fn tune_socket(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    sock_ref.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

async fn with_deadline<T>(
    deadline: Option<Instant>,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match deadline {
        Some(at) => match timeout_at(at.into(), fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout),
        },
        None => Ok(fut.await?),
    }
}

/// Like [`with_deadline`] but for futures that already return this
/// crate's [`Result`], so non-I/O errors (protocol violations) survive
/// a timeout race without being reboxed as I/O errors.
async fn with_deadline_result<T>(
    deadline: Option<Instant>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(at) => match timeout_at(at.into(), fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        },
        None => fut.await,
    }
}

/// Reads exactly one MBAP frame off `stream`. EOF before any header
/// byte is propagated as `None` (a clean end-of-stream the caller may
/// treat as "peer went away quietly"). EOF mid-frame is an error.
pub async fn read_frame(stream: &mut TcpStream) -> Result<Option<Frame>> {
    let mut header_buf = [0u8; HEADER_LEN];
    let mut read_so_far = 0;
    while read_so_far < HEADER_LEN {
        let n = stream.read(&mut header_buf[read_so_far..]).await?;
        if n == 0 {
            if read_so_far == 0 {
                return Ok(None);
            }
            return Err(Error::Protocol("connection closed mid-header".to_string()));
        }
        read_so_far += n;
    }
    let (header, pdu_len) = mbap::decode_header(&header_buf)?;
    let mut pdu = vec![0u8; pdu_len];
    stream.read_exact(&mut pdu).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Protocol("connection closed mid-PDU".to_string())
        } else {
            Error::Io(e)
        }
    })?;
    Ok(Some(Frame { header, pdu }))
}

/// Writes one MBAP frame, looping on short writes.
pub async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<()> {
    let bytes = frame.encode()?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// A single managed TCP connection. Exclusive access is enforced by
/// the inner mutex: `send` holds it for the entire round trip.
pub struct Transport {
    addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    next_transaction_id: AtomicU32,
}

impl Transport {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: Mutex::new(None),
            next_transaction_id: AtomicU32::new(1),
        }
    }

    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Allocates a fresh transaction ID. Wraps silently; any u16 value
    /// is valid on the wire.
    pub fn next_transaction_id(&self) -> u16 {
        (self.next_transaction_id.fetch_add(1, Ordering::Relaxed) & 0xFFFF) as u16
    }

    /// Dials the peer if not already connected. A concurrent or
    /// repeated call after success is a no-op.
    pub async fn connect(&self, deadline: Option<Instant>) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let stream = with_deadline(deadline, TcpStream::connect(self.addr)).await?;
        tune_socket(&stream)?;
        *guard = Some(stream);
        Ok(())
    }

    #[must_use]
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Closes the socket, if any. Idempotent.
    pub async fn close(&self) {
        let mut guard = self.stream.lock().await;
        *guard = None;
    }

    /// Sends `unit_id`/`pdu` as one transaction and returns the peer's
    /// response PDU. On any I/O or protocol error the socket is closed
    /// and the caller is left to reconnect.
    pub async fn send(
        &self,
        transaction_id: u16,
        unit_id: u8,
        pdu: Vec<u8>,
        deadline: Option<Instant>,
    ) -> Result<(Header, Vec<u8>)> {
        if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
            return Err(Error::InvalidRequest(format!(
                "PDU length {} outside 1..={MAX_PDU_LEN}",
                pdu.len()
            )));
        }
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(Error::NotConnected)?;

        let request = Frame {
            header: Header {
                transaction_id,
                unit_id,
            },
            pdu,
        };

        let result = async {
            write_frame(stream, &request).await?;
            match read_frame(stream).await? {
                Some(frame) => Ok(frame),
                None => Err(Error::Protocol("peer closed before responding".to_string())),
            }
        };

        match with_deadline_result(deadline, result).await {
            Ok(frame) => Ok((frame.header, frame.pdu)),
            Err(err) => {
                *guard = None;
                Err(err)
            }
        }
    }
}
