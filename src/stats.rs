//! Engine-wide counters and latency sampling. See `SPEC_FULL.md` §4.5, §8.
//!
//! Grounded on the teacher's atomic-counter style in
//! `src/client/session_stats.rs` (renamed here, same `AtomicU64` + snapshot
//! pattern) and on `examples/original_source/webants/stats.py`'s rolling
//! window of recent latencies for a cheap percentile estimate.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::sync::Mutex;

const LATENCY_WINDOW: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub requests_dispatched: u64,
    pub responses_ok: u64,
    pub responses_retried: u64,
    pub responses_exhausted: u64,
    pub bytes_downloaded: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
}

/// Atomic counters plus a bounded rolling window of recent latencies, so a
/// percentile snapshot never requires scanning the whole run's history.
pub struct Stats {
    requests_dispatched: AtomicU64,
    responses_ok: AtomicU64,
    responses_retried: AtomicU64,
    responses_exhausted: AtomicU64,
    bytes_downloaded: AtomicU64,
    recent_latencies: Mutex<VecDeque<Duration>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            requests_dispatched: AtomicU64::new(0),
            responses_ok: AtomicU64::new(0),
            responses_retried: AtomicU64::new(0),
            responses_exhausted: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            recent_latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }
}

impl Stats {
    pub fn record_dispatch(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.responses_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.responses_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_success(&self, bytes: u64, latency: Duration) {
        self.responses_ok.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        let mut window = self.recent_latencies.lock().await;
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency);
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let window = self.recent_latencies.lock().await;
        let mut sorted: Vec<Duration> = window.iter().copied().collect();
        drop(window);
        sorted.sort_unstable();
        let percentile = |p: f64| -> u64 {
            if sorted.is_empty() {
                return 0;
            }
            let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
            sorted[idx].as_millis() as u64
        };

        StatsSnapshot {
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            responses_ok: self.responses_ok.load(Ordering::Relaxed),
            responses_retried: self.responses_retried.load(Ordering::Relaxed),
            responses_exhausted: self.responses_exhausted.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            p50_latency_ms: percentile(0.50),
            p95_latency_ms: percentile(0.95),
        }
    }
}
