// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

/// Configuration for a [`super::Server`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub(crate) max_conns: usize,
    pub(crate) read_timeout: Duration,
}

impl ServerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_conns: 100,
            read_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new()
    }
}
