//! The frontier scheduler: priority queue plus URL deduplication, per-host
//! admission control, adaptive per-host delay with jitter, and a global cap.
//! See `SPEC_FULL.md` §4.2.
//!
//! Grounded on `examples/original_source/webants/scheduler.py` for the
//! admit-before-sleep ordering and the EWMA/jitter formula, and on the
//! teacher's `DashMap<K, Arc<V>>` per-entity registry pattern
//! (`src/client/pool_sessions.rs`) for per-host state.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering as AtomicOrdering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use rand::Rng;
use serde_json::json;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, warn};

use crate::{
    cfg::config::SchedulerConfig,
    driver::signal::{SignalBus, SignalName},
    model::{HostState, Request, fingerprint_request},
    url::host_key,
};

/// Outcome of `Frontier::admit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Filtered,
    Rejected { reason: &'static str },
}

/// Opaque handle returned by `next()`, required by `complete()`. Carries the
/// bookkeeping (host, semaphore permit) the public `Request` type does not
/// need to know about.
pub struct Ticket(u64);

struct PendingEntry {
    priority: i64,
    seq: u64,
    request: Request,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    /// `BinaryHeap` is a max-heap; reversed here so the smallest `priority`
    /// (and, within a tie, the smallest `seq`, i.e. earliest admission)
    /// compares greatest and is popped first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.cmp(&self.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct HostEntry {
    semaphore: Arc<Semaphore>,
    state: Mutex<HostState>,
}

struct FrontierInner {
    heap: BinaryHeap<PendingEntry>,
    seen: HashSet<[u8; 20]>,
    seq_counter: u64,
}

#[derive(Debug, Clone, Default)]
pub struct HostSnapshot {
    pub host: String,
    pub inflight: u32,
    pub ewma_interval_secs: f64,
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
}

#[derive(Debug, Clone, Default)]
pub struct FrontierSnapshot {
    pub total_admitted: u64,
    pub total_filtered: u64,
    pub total_rejected: u64,
    pub queue_depth: usize,
    pub hosts: Vec<HostSnapshot>,
}

/// Priority-ordered queue of pending requests plus a seen-set and per-host
/// state, per `SPEC_FULL.md` §3, §4.2.
pub struct Frontier {
    inner: Mutex<FrontierInner>,
    hosts: DashMap<String, Arc<HostEntry>>,
    not_empty: Notify,
    not_full: Notify,
    cfg: SchedulerConfig,
    pending_permits: DashMap<u64, (String, tokio::sync::OwnedSemaphorePermit)>,
    total_admitted: AtomicU64,
    total_filtered: AtomicU64,
    total_rejected: AtomicU64,
    signals: Arc<SignalBus>,
}

impl Frontier {
    pub fn new(cfg: SchedulerConfig, signals: Arc<SignalBus>) -> Self {
        Self {
            inner: Mutex::new(FrontierInner {
                heap: BinaryHeap::new(),
                seen: HashSet::new(),
                seq_counter: 0,
            }),
            hosts: DashMap::new(),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            cfg,
            pending_permits: DashMap::new(),
            total_admitted: AtomicU64::new(0),
            total_filtered: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            signals,
        }
    }

    /// Accepts a fresh candidate Request (subject to dedup).
    pub async fn admit(&self, req: Request) -> Admission {
        self.admit_inner(req, false).await
    }

    /// Re-admits a retried Request. Bypasses the `seen` dedup check: the
    /// fingerprint is already present and must not be re-inserted or
    /// re-counted (`SPEC_FULL.md` §9).
    pub async fn admit_retry(&self, req: Request) -> Admission {
        self.admit_inner(req, true).await
    }

    async fn admit_inner(&self, req: Request, is_retry: bool) -> Admission {
        if self.cfg.max_requests > 0 && self.total_admitted.load(AtomicOrdering::SeqCst) >= self.cfg.max_requests {
            self.total_rejected.fetch_add(1, AtomicOrdering::SeqCst);
            warn!(url = %req.url, "scheduler.max_requests reached, rejecting admission");
            return Admission::Rejected { reason: "max_requests_reached" };
        }

        let fp = fingerprint_request(&req);

        if !req.dont_filter && !is_retry {
            let inner = self.inner.lock().await;
            if inner.seen.contains(&fp) {
                drop(inner);
                self.total_filtered.fetch_add(1, AtomicOrdering::SeqCst);
                return Admission::Filtered;
            }
        }

        let Some(host) = host_key(&req.url) else {
            self.total_rejected.fetch_add(1, AtomicOrdering::SeqCst);
            warn!(url = %req.url, "admission rejected: url has no host");
            return Admission::Rejected { reason: "no_host" };
        };

        let entry = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| {
                Arc::new(HostEntry {
                    semaphore: Arc::new(Semaphore::new(self.cfg.max_domain_concurrent)),
                    state: Mutex::new(HostState::default()),
                })
            })
            .clone();

        let Ok(permit) = Arc::clone(&entry.semaphore).acquire_owned().await else {
            self.total_rejected.fetch_add(1, AtomicOrdering::SeqCst);
            return Admission::Rejected { reason: "host_closed" };
        };

        let effective_delay = {
            let state = entry.state.lock().await;
            let jitter: f64 = rand::rng().random_range(0.8..1.2);
            self.cfg.domain_delay.as_secs_f64().max(state.ewma_interval_secs * jitter)
        };
        if effective_delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(effective_delay)).await;
        }

        {
            let mut state = entry.state.lock().await;
            let now = Instant::now();
            if let Some(last) = state.last_dispatch {
                state.observe_interval(now.duration_since(last).as_secs_f64());
            }
            state.last_dispatch = Some(now);
            state.inflight += 1;
        }

        if !is_retry {
            let mut inner = self.inner.lock().await;
            inner.seen.insert(fp);
        }
        self.total_admitted.fetch_add(1, AtomicOrdering::SeqCst);

        let log_url = req.url.clone();
        let priority = req.priority;

        let seq = loop {
            let mut inner = self.inner.lock().await;
            if inner.heap.len() < self.cfg.max_queue_size {
                let seq = inner.seq_counter;
                inner.seq_counter += 1;
                inner.heap.push(PendingEntry { priority, seq, request: req });
                break seq;
            }
            drop(inner);
            self.not_full.notified().await;
        };

        self.pending_permits.insert(seq, (host, permit));
        self.not_empty.notify_one();

        debug!(url = %log_url, priority, "admitted");
        self.signals.send(SignalName::RequestScheduled, &json!({"url": log_url, "priority": priority}));
        Admission::Admitted
    }

    /// Pops the smallest `(priority, insertion_seq)`. Blocks until one is
    /// available.
    pub async fn next(&self) -> (Request, Ticket) {
        loop {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.heap.pop() {
                drop(inner);
                self.not_full.notify_one();
                if !self.cfg.request_delay.is_zero() {
                    tokio::time::sleep(self.cfg.request_delay).await;
                }
                self.signals.send(SignalName::RequestReached, &json!({"url": entry.request.url}));
                return (entry.request, Ticket(entry.seq));
            }
            drop(inner);
            self.not_empty.notified().await;
        }
    }

    /// Decrements `inflight` for the ticket's host and releases the per-host
    /// semaphore slot. Idempotent: a second `complete()` for the same
    /// ticket is a no-op.
    pub async fn complete(&self, ticket: Ticket) {
        if let Some((_, (host, _permit))) = self.pending_permits.remove(&ticket.0) {
            if let Some(entry) = self.hosts.get(&host) {
                let mut state = entry.state.lock().await;
                state.inflight = state.inflight.saturating_sub(1);
            }
        }
    }

    pub async fn stats(&self) -> FrontierSnapshot {
        let queue_depth = self.inner.lock().await.heap.len();
        let mut hosts = Vec::with_capacity(self.hosts.len());
        for entry in self.hosts.iter() {
            let state = entry.value().state.lock().await;
            hosts.push(HostSnapshot {
                host: entry.key().clone(),
                inflight: state.inflight,
                ewma_interval_secs: state.ewma_interval_secs,
                min_interval_secs: state.min_interval_secs,
                max_interval_secs: state.max_interval_secs,
            });
        }
        FrontierSnapshot {
            total_admitted: self.total_admitted.load(AtomicOrdering::SeqCst),
            total_filtered: self.total_filtered.load(AtomicOrdering::SeqCst),
            total_rejected: self.total_rejected.load(AtomicOrdering::SeqCst),
            queue_depth,
            hosts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Method;

    fn cfg() -> SchedulerConfig {
        SchedulerConfig {
            max_requests: 0,
            request_delay: Duration::ZERO,
            domain_delay: Duration::ZERO,
            max_domain_concurrent: 2,
            max_queue_size: 16,
        }
    }

    #[tokio::test]
    async fn dedup_filters_second_admission() {
        let frontier = Frontier::new(cfg(), Arc::new(SignalBus::new()));
        let a = Request::get("http://example.com/a?b=1&a=2");
        let b = Request::get("http://example.com/a?a=2&b=1");
        assert_eq!(frontier.admit(a).await, Admission::Admitted);
        assert_eq!(frontier.admit(b).await, Admission::Filtered);
        let snap = frontier.stats().await;
        assert_eq!(snap.total_admitted, 1);
        assert_eq!(snap.total_filtered, 1);
    }

    #[tokio::test]
    async fn priority_order_is_fifo_within_ties() {
        let frontier = Frontier::new(cfg(), Arc::new(SignalBus::new()));
        for (i, p) in [5, 1, 3, 1].into_iter().enumerate() {
            let mut r = Request::get(format!("http://example.com/{i}"));
            r.priority = p;
            r.dont_filter = true;
            assert_eq!(frontier.admit(r).await, Admission::Admitted);
        }
        let mut order = Vec::new();
        for _ in 0..4 {
            let (req, ticket) = frontier.next().await;
            order.push(req.priority);
            frontier.complete(ticket).await;
        }
        assert_eq!(order, vec![1, 1, 3, 5]);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let frontier = Frontier::new(cfg(), Arc::new(SignalBus::new()));
        let r = Request::get("http://example.com/a");
        frontier.admit(r).await;
        let (_, ticket) = frontier.next().await;
        let host = "example.com".to_string();
        let before = frontier.hosts.get(&host).unwrap().state.lock().await.inflight;
        assert_eq!(before, 1);
        // Ticket is not Clone; simulate a double-complete via raw field access
        // in this in-crate test only.
        let ticket_value = ticket.0;
        frontier.complete(Ticket(ticket_value)).await;
        frontier.complete(Ticket(ticket_value)).await;
        let after = frontier.hosts.get(&host).unwrap().state.lock().await.inflight;
        assert_eq!(after, 0);
    }

    #[tokio::test]
    async fn per_host_concurrency_is_bounded() {
        let mut c = cfg();
        c.max_domain_concurrent = 2;
        let frontier = Arc::new(Frontier::new(c, Arc::new(SignalBus::new())));
        for i in 0..4 {
            let mut r = Request::get(format!("http://example.com/{i}"));
            r.dont_filter = true;
            frontier.admit(r).await;
        }
        let (_, t1) = frontier.next().await;
        let (_, t2) = frontier.next().await;
        let snap = frontier.stats().await;
        assert_eq!(snap.hosts[0].inflight, 2);
        frontier.complete(t1).await;
        frontier.complete(t2).await;
    }

    #[test]
    fn method_as_str_matches_get() {
        assert_eq!(Method::Get.as_str(), "GET");
    }
}
