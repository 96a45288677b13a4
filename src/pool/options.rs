// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use crate::client::ClientOptions;

/// Configuration for a [`super::Pool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub(crate) size: usize,
    pub(crate) max_idle_time: Duration,
    pub(crate) health_check_freq: Duration,
    pub(crate) client_options: ClientOptions,
}

impl PoolOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            size: 5,
            max_idle_time: Duration::from_secs(5 * 60),
            health_check_freq: Duration::from_secs(60),
            client_options: ClientOptions::new(),
        }
    }

    /// Upper bound on total managed clients. Values below 1 are
    /// normalized to 1.
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    /// Period of background health sweeps; zero disables the
    /// background health checker entirely.
    #[must_use]
    pub fn with_health_check_freq(mut self, freq: Duration) -> Self {
        self.health_check_freq = freq;
        self
    }

    #[must_use]
    pub fn with_client_options(mut self, client_options: ClientOptions) -> Self {
        self.client_options = client_options;
        self
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new()
    }
}
