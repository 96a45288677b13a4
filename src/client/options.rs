// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

type ConnectHook = Arc<dyn Fn() + Send + Sync>;
type DisconnectHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Configuration for a [`super::Client`].
///
/// Construct with [`ClientOptions::default`] and adjust with the
/// builder methods; all fields have sensible defaults.
#[derive(Clone)]
pub struct ClientOptions {
    pub(crate) unit_id: u8,
    pub(crate) timeout: Duration,
    pub(crate) auto_reconnect: bool,
    pub(crate) reconnect_backoff: Duration,
    pub(crate) max_reconnect_time: Duration,
    pub(crate) max_retries: u32,
    pub(crate) on_connect: Option<ConnectHook>,
    pub(crate) on_disconnect: Option<DisconnectHook>,
}

impl ClientOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            unit_id: 1,
            timeout: Duration::from_secs(5),
            auto_reconnect: false,
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_time: Duration::from_secs(30),
            max_retries: 3,
            on_connect: None,
            on_disconnect: None,
        }
    }

    #[must_use]
    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    #[must_use]
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_max_reconnect_time(mut self, max: Duration) -> Self {
        self.max_reconnect_time = max;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    #[must_use]
    pub fn with_on_connect(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn with_on_disconnect(
        mut self,
        callback: impl Fn(&Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("unit_id", &self.unit_id)
            .field("timeout", &self.timeout)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .field("max_reconnect_time", &self.max_reconnect_time)
            .field("max_retries", &self.max_retries)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}
