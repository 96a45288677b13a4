// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Modbus TCP server: a bounded accept loop plus one worker per
//! connection, dispatching onto a shared [`RequestHandler`].

mod dispatch;
mod handler;
mod options;

pub use handler::{HandlerError, HandlerResult, ModbusException, RequestHandler};
pub use options::ServerOptions;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::codec::mbap::Frame;
use crate::error::Result;
use crate::metrics::ServerMetrics;
use crate::transport;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    sock_ref.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// A Modbus TCP server bound to a shared handler.
///
/// Always lives behind an `Arc` (see [`Server::new`]): every accepted
/// connection's worker holds a clone back to the server so it can
/// update metrics and observe `close()`.
pub struct Server {
    handler: Arc<dyn RequestHandler>,
    options: ServerOptions,
    pub metrics: ServerMetrics,
    closed: AtomicBool,
    cancel: CancelToken,
    active: AtomicUsize,
    local_addr: Mutex<Option<SocketAddr>>,
    workers: Mutex<JoinSet<()>>,
}

impl Server {
    #[must_use]
    pub fn new(handler: Arc<dyn RequestHandler>, options: ServerOptions) -> Arc<Self> {
        Arc::new(Self {
            handler,
            options,
            metrics: ServerMetrics::default(),
            closed: AtomicBool::new(false),
            cancel: CancelToken::new(),
            active: AtomicUsize::new(0),
            local_addr: Mutex::new(None),
            workers: Mutex::new(JoinSet::new()),
        })
    }

    #[must_use]
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Binds `addr` and serves until [`Self::close`] is called.
    pub async fn listen_and_serve(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Like [`Self::listen_and_serve`], but also closes the server as
    /// soon as `external` is cancelled.
    pub async fn listen_and_serve_context(
        self: &Arc<Self>,
        addr: SocketAddr,
        external: CancelToken,
    ) -> Result<()> {
        let watched = Arc::clone(self);
        tokio::spawn(async move {
            external.cancelled().await;
            watched.close().await;
        });
        self.listen_and_serve(addr).await
    }

    /// Drives the accept loop over an already-bound listener until
    /// [`Self::close`] is called.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        *self.local_addr.lock().await = Some(listener.local_addr()?);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => self.handle_accept(socket, peer).await,
                        Err(err) => log::warn!("accept error: {err}"),
                    }
                }
            }
            self.reap_finished_workers().await;
        }

        self.drain_workers().await;
        Ok(())
    }

    async fn handle_accept(self: &Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        if self.active.load(Ordering::SeqCst) >= self.options.max_conns {
            log::warn!(
                "rejecting connection from {peer}: at max_conns ({})",
                self.options.max_conns
            );
            return;
        }
        if let Err(err) = tune_socket(&socket) {
            log::warn!("failed to tune socket for {peer}: {err}");
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        self.metrics.active_conns.incr();
        self.metrics.total_conns.incr();

        let server = Arc::clone(self);
        self.workers.lock().await.spawn(async move {
            server.run_connection(socket).await;
        });
    }

    async fn reap_finished_workers(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(result) = workers.try_join_next() {
            log_worker_panic(result);
        }
    }

    async fn drain_workers(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(result) = workers.join_next().await {
            log_worker_panic(result);
        }
    }

    /// Terminal; idempotent. Stops the accept loop, wakes every
    /// connection worker blocked on an idle read (each races its read
    /// against this cancellation alongside `read_timeout`), and waits
    /// for all of them to finish before returning.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.drain_workers().await;
    }

    async fn run_connection(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let frame = match self.read_with_deadline(&mut stream).await {
                ReadOutcome::Frame(frame) => frame,
                ReadOutcome::Eof => break,
                ReadOutcome::TimedOut => {
                    log::debug!("connection idle timeout, closing");
                    break;
                }
                ReadOutcome::Cancelled => {
                    log::debug!("server closing, dropping idle connection");
                    break;
                }
                ReadOutcome::Error(err) => {
                    log::debug!("connection read error, closing: {err}");
                    break;
                }
            };

            self.metrics.requests_total.incr();
            let response_pdu =
                dispatch::dispatch(self.handler.as_ref(), frame.header.unit_id, &frame.pdu).await;
            let response = Frame {
                header: frame.header,
                pdu: response_pdu,
            };

            let write_result = match self.deadline() {
                Some(at) => tokio::time::timeout_at(
                    at.into(),
                    transport::write_frame(&mut stream, &response),
                )
                .await
                .unwrap_or(Err(crate::error::Error::Timeout)),
                None => transport::write_frame(&mut stream, &response).await,
            };

            match write_result {
                Ok(()) => self.metrics.requests_success.incr(),
                Err(err) => {
                    log::debug!("connection write error, closing: {err}");
                    self.metrics.requests_errors.incr();
                    break;
                }
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.metrics.active_conns.decr();
    }

    fn deadline(&self) -> Option<Instant> {
        if self.options.read_timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.options.read_timeout)
        }
    }

    /// Races one frame read against both `read_timeout` and
    /// `self.cancel`, so a connection sitting idle notices `close()`
    /// immediately instead of waiting out the read deadline.
    async fn read_with_deadline(&self, stream: &mut TcpStream) -> ReadOutcome {
        let timed_read = async {
            let read = transport::read_frame(stream);
            let result = match self.deadline() {
                Some(at) => match tokio::time::timeout_at(at.into(), read).await {
                    Ok(result) => result,
                    Err(_) => return ReadOutcome::TimedOut,
                },
                None => read.await,
            };
            match result {
                Ok(Some(frame)) => ReadOutcome::Frame(frame),
                Ok(None) => ReadOutcome::Eof,
                Err(err) => ReadOutcome::Error(err),
            }
        };

        tokio::select! {
            () = self.cancel.cancelled() => ReadOutcome::Cancelled,
            outcome = timed_read => outcome,
        }
    }
}

enum ReadOutcome {
    Frame(Frame),
    Eof,
    TimedOut,
    Cancelled,
    Error(crate::error::Error),
}

fn log_worker_panic(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(join_err) = result {
        if join_err.is_panic() {
            log::error!("connection worker panicked: {join_err}");
        }
    }
}
