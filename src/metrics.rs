// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concurrency-safe counters and latency histograms for the client,
//! server and connection pool.
//!
//! Every counter is a bare atomic; aggregates (`Metrics`, `ServerMetrics`,
//! `PoolMetrics`) only group them and hand out plain-data snapshots via
//! `snapshot()`. Nothing here blocks or allocates on the hot path,
//! except the lazily-created per-function breakdown map which takes a
//! short-lived lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const LATENCY_BUCKETS_MS: [f64; 10] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
];

/// A monotonically-increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A signed gauge, for values that can move in either direction
/// (active connection counts, pool availability).
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn incr(&self) {
        self.add(1);
    }

    pub fn decr(&self) {
        self.add(-1);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct HistogramState {
    buckets: [u64; LATENCY_BUCKETS_MS.len()],
    count: u64,
    sum_ms: f64,
    min_ms: Option<f64>,
    max_ms: Option<f64>,
}

impl Default for HistogramState {
    fn default() -> Self {
        Self {
            buckets: [0; LATENCY_BUCKETS_MS.len()],
            count: 0,
            sum_ms: 0.0,
            min_ms: None,
            max_ms: None,
        }
    }
}

/// A fixed-bucket latency histogram, tracked in milliseconds.
#[derive(Debug, Default)]
pub struct LatencyHistogram(Mutex<HistogramState>);

impl LatencyHistogram {
    pub fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut state = self.0.lock().expect("latency histogram mutex poisoned");
        state.count += 1;
        state.sum_ms += ms;
        state.min_ms = Some(state.min_ms.map_or(ms, |cur| cur.min(ms)));
        state.max_ms = Some(state.max_ms.map_or(ms, |cur| cur.max(ms)));
        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|&upper| ms <= upper)
            .unwrap_or(LATENCY_BUCKETS_MS.len() - 1);
        state.buckets[bucket] += 1;
    }

    pub fn snapshot(&self) -> LatencyHistogramSnapshot {
        let state = self.0.lock().expect("latency histogram mutex poisoned");
        LatencyHistogramSnapshot {
            count: state.count,
            sum_ms: state.sum_ms,
            min_ms: state.min_ms.unwrap_or(0.0),
            max_ms: state.max_ms.unwrap_or(0.0),
            buckets: state.buckets,
        }
    }
}

/// Point-in-time copy of a [`LatencyHistogram`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyHistogramSnapshot {
    pub count: u64,
    pub sum_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub buckets: [u64; LATENCY_BUCKETS_MS.len()],
}

impl LatencyHistogramSnapshot {
    #[must_use]
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }
}

#[derive(Debug, Default)]
struct FunctionMetrics {
    requests: Counter,
    errors: Counter,
    latency: LatencyHistogram,
}

/// Snapshot of the per-function-code slice of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FunctionMetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub latency: LatencyHistogramSnapshot,
}

/// Client-side metrics: request counts, reconnections, active
/// connections, overall and per-function latency.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: Counter,
    pub requests_success: Counter,
    pub requests_errors: Counter,
    pub reconnections: Counter,
    pub active_conns: Gauge,
    pub latency: LatencyHistogram,
    by_function: Mutex<HashMap<u8, FunctionMetrics>>,
}

impl Metrics {
    pub fn observe(&self, function_code: u8, elapsed: Duration, is_error: bool) {
        self.requests_total.incr();
        if is_error {
            self.requests_errors.incr();
        } else {
            self.requests_success.incr();
        }
        self.latency.observe(elapsed);

        let mut by_function = self
            .by_function
            .lock()
            .expect("per-function metrics mutex poisoned");
        let entry = by_function.entry(function_code).or_default();
        entry.requests.incr();
        if is_error {
            entry.errors.incr();
        }
        entry.latency.observe(elapsed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let by_function = self
            .by_function
            .lock()
            .expect("per-function metrics mutex poisoned")
            .iter()
            .map(|(fc, m)| {
                (
                    *fc,
                    FunctionMetricsSnapshot {
                        requests: m.requests.get(),
                        errors: m.errors.get(),
                        latency: m.latency.snapshot(),
                    },
                )
            })
            .collect();
        MetricsSnapshot {
            requests_total: self.requests_total.get(),
            requests_success: self.requests_success.get(),
            requests_errors: self.requests_errors.get(),
            reconnections: self.reconnections.get(),
            active_conns: self.active_conns.get(),
            latency: self.latency.snapshot(),
            by_function,
        }
    }
}

/// Plain-data snapshot of [`Metrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_errors: u64,
    pub reconnections: u64,
    pub active_conns: i64,
    pub latency: LatencyHistogramSnapshot,
    pub by_function: Vec<(u8, FunctionMetricsSnapshot)>,
}

/// Server-side metrics.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub requests_total: Counter,
    pub requests_success: Counter,
    pub requests_errors: Counter,
    pub active_conns: Gauge,
    pub total_conns: Counter,
}

impl ServerMetrics {
    #[must_use]
    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            requests_total: self.requests_total.get(),
            requests_success: self.requests_success.get(),
            requests_errors: self.requests_errors.get(),
            active_conns: self.active_conns.get(),
            total_conns: self.total_conns.get(),
        }
    }
}

/// Plain-data snapshot of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerMetricsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_errors: u64,
    pub active_conns: i64,
    pub total_conns: u64,
}

/// Connection-pool metrics.
///
/// `created` is the live count of managed clients (in-use + idle), not
/// a monotonic total: the pool-accounting invariant `created <= size`
/// only holds for a value that can go back down, so it is a gauge like
/// `available` rather than a counter like `closed`.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub gets: Counter,
    pub puts: Counter,
    pub hits: Counter,
    pub misses: Counter,
    pub timeouts: Counter,
    pub created: Gauge,
    pub closed: Counter,
    pub available: Gauge,
}

impl PoolMetrics {
    #[must_use]
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            gets: self.gets.get(),
            puts: self.puts.get(),
            hits: self.hits.get(),
            misses: self.misses.get(),
            timeouts: self.timeouts.get(),
            created: self.created.get(),
            closed: self.closed.get(),
            available: self.available.get(),
        }
    }
}

/// Plain-data snapshot of [`PoolMetrics`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolMetricsSnapshot {
    pub gets: u64,
    pub puts: u64,
    pub hits: u64,
    pub misses: u64,
    pub timeouts: u64,
    pub created: i64,
    pub closed: u64,
    pub available: i64,
}
