// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A bounded pool of reusable [`Client`] connections.

mod options;

pub use options::PoolOptions;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::metrics::PoolMetrics;

struct IdleEntry {
    client: Arc<Client>,
    last_used: Instant,
}

struct PoolState {
    addr: SocketAddr,
    options: PoolOptions,
    metrics: PoolMetrics,
    closed: AtomicBool,
    live: Mutex<usize>,
    idle: Mutex<VecDeque<IdleEntry>>,
    notify: Notify,
    cancel: CancelToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// A bounded pool of reusable [`Client`] connections to a single
/// address. Cheap to clone: clones share the same underlying state.
#[derive(Clone)]
pub struct Pool(Arc<PoolState>);

impl Pool {
    #[must_use]
    pub fn new(addr: SocketAddr, options: PoolOptions) -> Self {
        let state = Arc::new(PoolState {
            addr,
            options,
            metrics: PoolMetrics::default(),
            closed: AtomicBool::new(false),
            live: Mutex::new(0),
            idle: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cancel: CancelToken::new(),
            health_task: Mutex::new(None),
        });
        if !state.options.health_check_freq.is_zero() {
            let task_state = Arc::clone(&state);
            let handle = tokio::spawn(health_check_loop(task_state));
            // `new` cannot be async, and the task only exists once the
            // Arc is fully constructed, so stash the handle afterward.
            if let Ok(mut guard) = state.health_task.try_lock() {
                *guard = Some(handle);
            }
        }
        Self(state)
    }

    #[must_use]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.0.metrics
    }

    fn check_closed(&self) -> Result<()> {
        if self.0.closed.load(Ordering::SeqCst) {
            Err(Error::PoolClosed)
        } else {
            Ok(())
        }
    }

    /// Acquires a connected client, creating one if the pool has spare
    /// capacity or blocking until one is returned otherwise.
    pub async fn get(&self, deadline: Option<Instant>) -> Result<PooledClient> {
        self.check_closed()?;
        self.0.metrics.gets.incr();

        if let Some(entry) = self.pop_idle().await {
            self.0.metrics.hits.incr();
            if self.entry_is_fresh(&entry).await {
                return Ok(self.wrap(entry.client));
            }
            self.retire(entry.client).await;
        } else {
            self.0.metrics.misses.incr();
        }

        if let Some(client) = self.try_create().await? {
            return Ok(self.wrap(client));
        }

        self.wait_for_slot(deadline).await
    }

    async fn wait_for_slot(&self, deadline: Option<Instant>) -> Result<PooledClient> {
        loop {
            self.check_closed()?;

            if let Some(entry) = self.pop_idle().await {
                if self.entry_is_fresh(&entry).await {
                    return Ok(self.wrap(entry.client));
                }
                self.retire(entry.client).await;
                continue;
            }
            if let Some(client) = self.try_create().await? {
                return Ok(self.wrap(client));
            }

            let notified = self.0.notify.notified();
            tokio::select! {
                () = notified => {}
                () = self.0.cancel.cancelled() => return Err(Error::PoolClosed),
                () = wait_until(deadline) => {
                    self.0.metrics.timeouts.incr();
                    return Err(Error::PoolTimeout);
                }
            }
        }
    }

    /// Returns a previously-acquired client to the idle queue, or
    /// closes it if the pool is closed or the client is no longer
    /// connected.
    async fn put(&self, client: Arc<Client>) {
        self.0.metrics.puts.incr();
        if self.0.closed.load(Ordering::SeqCst) || !client.is_connected().await {
            self.retire(client).await;
            return;
        }
        self.push_idle(IdleEntry {
            client,
            last_used: Instant::now(),
        })
        .await;
        self.0.notify.notify_one();
    }

    /// Destroys `client` instead of returning it to the idle queue;
    /// used when the caller knows the connection is unusable.
    async fn discard(&self, client: Arc<Client>) {
        self.0.metrics.puts.incr();
        self.retire(client).await;
    }

    async fn try_create(&self) -> Result<Option<Arc<Client>>> {
        {
            let mut live = self.0.live.lock().await;
            if *live >= self.0.options.size {
                return Ok(None);
            }
            *live += 1;
            self.0.metrics.created.set(*live as i64);
        }
        let client = Arc::new(Client::new(self.0.addr, self.0.options.client_options.clone()));
        match client.connect().await {
            Ok(()) => Ok(Some(client)),
            Err(err) => {
                let mut live = self.0.live.lock().await;
                *live = live.saturating_sub(1);
                self.0.metrics.created.set(*live as i64);
                Err(err)
            }
        }
    }

    async fn retire(&self, client: Arc<Client>) {
        client.close().await;
        let mut live = self.0.live.lock().await;
        *live = live.saturating_sub(1);
        self.0.metrics.created.set(*live as i64);
        drop(live);
        self.0.metrics.closed.incr();
        self.0.notify.notify_one();
    }

    async fn pop_idle(&self) -> Option<IdleEntry> {
        let mut idle = self.0.idle.lock().await;
        let entry = idle.pop_front();
        if entry.is_some() {
            self.0.metrics.available.decr();
        }
        entry
    }

    async fn push_idle(&self, entry: IdleEntry) {
        let mut idle = self.0.idle.lock().await;
        idle.push_back(entry);
        self.0.metrics.available.incr();
    }

    async fn entry_is_fresh(&self, entry: &IdleEntry) -> bool {
        if !entry.client.is_connected().await {
            return false;
        }
        let max_idle = self.0.options.max_idle_time;
        max_idle.is_zero() || entry.last_used.elapsed() <= max_idle
    }

    fn wrap(&self, client: Arc<Client>) -> PooledClient {
        PooledClient {
            pool: self.clone(),
            client: Some(client),
            returned: AtomicBool::new(false),
        }
    }

    /// Terminal; idempotent. Stops the health checker, closes every
    /// idle entry, and rejects subsequent acquires with
    /// [`Error::PoolClosed`].
    pub async fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.cancel.cancel();
        self.0.notify.notify_waiters();

        let drained: Vec<IdleEntry> = {
            let mut idle = self.0.idle.lock().await;
            idle.drain(..).collect()
        };
        for entry in drained {
            self.0.metrics.available.decr();
            self.retire(entry.client).await;
        }

        let handle = self.0.health_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending::<()>().await,
    }
}

async fn health_check_loop(state: Arc<PoolState>) {
    let mut interval = tokio::time::interval(state.options.health_check_freq);
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = state.cancel.cancelled() => return,
        }
        sweep_idle(&state).await;
    }
}

async fn sweep_idle(state: &Arc<PoolState>) {
    let entries: Vec<IdleEntry> = {
        let mut idle = state.idle.lock().await;
        let drained = idle.drain(..).collect::<Vec<_>>();
        state.metrics.available.set(0);
        drained
    };

    let mut survivors = Vec::with_capacity(entries.len());
    for entry in entries {
        let stale = !entry.client.is_connected().await
            || (!state.options.max_idle_time.is_zero()
                && entry.last_used.elapsed() > state.options.max_idle_time);
        if stale {
            entry.client.close().await;
            let mut live = state.live.lock().await;
            *live = live.saturating_sub(1);
            state.metrics.created.set(*live as i64);
            drop(live);
            state.metrics.closed.incr();
        } else {
            survivors.push(entry);
        }
    }

    let mut idle = state.idle.lock().await;
    state.metrics.available.set(survivors.len() as i64);
    idle.extend(survivors);
}

/// An acquired client, automatically returned to its pool when closed.
/// `close`/`discard` are idempotent; dropping without either falls
/// back to an implicit return so callers cannot leak capacity by
/// forgetting to release it.
pub struct PooledClient {
    pool: Pool,
    client: Option<Arc<Client>>,
    returned: AtomicBool,
}

impl PooledClient {
    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        self.client
            .as_ref()
            .expect("PooledClient used after being returned")
    }

    /// Returns the client to the pool. Idempotent.
    pub async fn close(&mut self) {
        if self.returned.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(client) = self.client.take() {
            self.pool.put(client).await;
        }
    }

    /// Destroys the underlying client instead of returning it; use
    /// this when the caller knows the connection is bad. Idempotent
    /// with respect to `close`.
    pub async fn discard(mut self) {
        if self.returned.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(client) = self.client.take() {
            self.pool.discard(client).await;
        }
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if self.returned.load(Ordering::SeqCst) {
            return;
        }
        if let Some(client) = self.client.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.put(client).await;
            });
        }
    }
}
