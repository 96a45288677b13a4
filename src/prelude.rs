// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Convenience re-exports of the types most callers need.

pub use crate::cancel::CancelToken;
pub use crate::client::{Client, ClientOptions, ConnectionState};
pub use crate::codec::ExceptionCode;
pub use crate::error::{Error, Result};
pub use crate::pool::{Pool, PoolOptions, PooledClient};
pub use crate::server::{HandlerResult, ModbusException, RequestHandler, Server, ServerOptions};
