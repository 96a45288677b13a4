// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A Modbus TCP client, server and connection pool.
//!
//! - [`codec`] turns PDUs into bytes and back, with no I/O of its own.
//! - [`transport`] drives a single TCP connection's request/response
//!   round trips.
//! - [`client`] is the session-level API: connect, reconnect with
//!   backoff, and the twelve Modbus operations.
//! - [`server`] dispatches incoming requests onto a [`server::RequestHandler`].
//! - [`pool`] manages a bounded set of reusable [`client::Client`] connections.
//!
//! Most applications only need [`prelude`].

pub mod cancel;
pub mod client;
pub mod codec;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod prelude;
pub mod server;
pub mod transport;

pub use error::{Error, Result};
