//! Bounded concurrent HTTP executor with status-code-aware retry/backoff.
//! See `SPEC_FULL.md` §4.3.
//!
//! Grounded on `examples/original_source/webants/downloader.py`'s
//! fetch-then-classify-then-retry loop, and on the teacher's worker-pool
//! shape in `src/client/session.rs` (`Arc<Self>` plus `tokio::select!`
//! racing cancellation against the unit of work).

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod retry;
pub mod transport;

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::DownloaderConfig,
    circuit::CircuitRegistry,
    downloader::{
        retry::{TRANSPORT_BACKOFF_FACTOR, backoff_delay, retry_policy_for_status},
        transport::{RawResponse, Transport},
    },
    driver::signal::{SignalBus, SignalName},
    error::TransportError,
    frontier::{Admission, Frontier},
    model::{Request, Response},
    stats::Stats,
    url::host_key,
};

/// Fetches one `Request` exactly one attempt at a time, applying the
/// retry/backoff policy from `SPEC_FULL.md` §4.3. A retryable outcome is
/// never resolved by looping in place: the Request is re-admitted through
/// `frontier` with a bumped priority and a decremented retry budget, and
/// this call yields no Response. Only a terminal outcome (success,
/// non-retryable status, or exhausted budget) yields one.
pub struct Downloader {
    transport: Arc<dyn Transport>,
    global: Arc<Semaphore>,
    retry_delay: std::time::Duration,
    frontier: Arc<Frontier>,
    circuits: Arc<CircuitRegistry>,
    signals: Arc<SignalBus>,
    stats: Arc<Stats>,
}

impl Downloader {
    pub fn new(
        cfg: &DownloaderConfig,
        transport: Arc<dyn Transport>,
        frontier: Arc<Frontier>,
        circuits: Arc<CircuitRegistry>,
        signals: Arc<SignalBus>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            transport,
            global: Arc::new(Semaphore::new(cfg.concurrency)),
            retry_delay: cfg.retry_delay,
            frontier,
            circuits,
            signals,
            stats,
        }
    }

    /// Runs one request through the global concurrency gate for a single
    /// attempt. The permit is held only across the HTTP exchange itself and
    /// released before any backoff sleep or re-admission, so a retry chain
    /// re-contends for a slot through the scheduler rather than pinning one
    /// for its whole lifetime.
    pub async fn fetch(&self, req: Request, cancel: &CancellationToken) -> Option<Response> {
        let permit = match self.global.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Some(Response::retry_exhausted(req)),
        };
        self.stats.record_dispatch();
        let result = self.transport.execute(&req, cancel).await;
        drop(permit);
        self.fetch_with_retry(req, result, cancel).await
    }

    /// Classifies a single attempt's outcome. Returns `Some(Response)` on
    /// any terminal outcome, `None` once the request has been handed back
    /// to the scheduler for a later retry.
    async fn fetch_with_retry(
        &self,
        mut req: Request,
        result: Result<RawResponse, TransportError>,
        cancel: &CancellationToken,
    ) -> Option<Response> {
        match result {
            Ok(raw) => {
                if let Some(policy) = retry_policy_for_status(raw.status) {
                    // `retries_remaining` is a single shared budget field on
                    // the Request (SPEC_FULL §3); the first retryable
                    // outcome it meets seeds it from that status's table
                    // entry, later ones just spend it down.
                    if req.retries_remaining == 0 {
                        req.retries_remaining = policy.max_retries;
                    }
                    if req.retries_remaining > 0 {
                        let attempt = policy.max_retries - req.retries_remaining;
                        self.stats.record_retry();
                        let delay = backoff_delay(self.retry_delay, policy.backoff_factor, attempt);
                        warn!(
                            url = %req.url,
                            status = raw.status,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after HTTP status"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {},
                            () = tokio::time::sleep(delay) => {},
                        }
                        req.retries_remaining -= 1;
                        req.priority += 10;
                        if self.frontier.admit_retry(req).await != Admission::Admitted {
                            warn!("retry re-admission was not admitted");
                        }
                        return None;
                    }
                    // HTTP-retryable exhaustion returns the real status
                    // as-is; only transport-error exhaustion is reported
                    // via the synthetic 600. Exhaustion is still a circuit
                    // failure regardless of the numeric status.
                    debug!(url = %req.url, status = raw.status, "retry budget exhausted, returning last status");
                    self.record_circuit_outcome(&req, false);
                    self.signals
                        .send(SignalName::ResponseReceived, &json!({"url": raw.url, "status": raw.status}));
                    return Some(Response {
                        status: raw.status,
                        headers: raw.headers,
                        body: raw.body,
                        url: raw.url,
                        elapsed: raw.elapsed,
                        request: req,
                        retry_exhausted: false,
                    });
                }

                let success = raw.status < 500 && raw.status != 429;
                self.record_circuit_outcome(&req, success);
                self.stats.record_success(raw.body.len() as u64, raw.elapsed).await;
                self.signals
                    .send(SignalName::ResponseReceived, &json!({"url": raw.url, "status": raw.status}));
                Some(Response {
                    status: raw.status,
                    headers: raw.headers,
                    body: raw.body,
                    url: raw.url,
                    elapsed: raw.elapsed,
                    request: req,
                    retry_exhausted: false,
                })
            },
            Err(TransportError::Cancelled) => Some(Response::retry_exhausted(req)),
            Err(TransportError::RedirectOverflow) => {
                // Terminal, non-retryable: never consumes a retry attempt.
                self.stats.record_exhausted();
                self.record_circuit_outcome(&req, false);
                self.signals.send(
                    SignalName::RequestFailed,
                    &json!({"url": req.url, "error": "redirect_overflow"}),
                );
                Some(Response::retry_exhausted(req))
            },
            Err(err) => {
                if req.retries_remaining == 0 {
                    req.retries_remaining = transport_max_retries();
                }
                if req.retries_remaining > 0 {
                    let attempt = transport_max_retries() - req.retries_remaining;
                    self.stats.record_retry();
                    let delay = backoff_delay(self.retry_delay, TRANSPORT_BACKOFF_FACTOR, attempt);
                    warn!(url = %req.url, %err, attempt, "retrying after transport error");
                    tokio::select! {
                        _ = cancel.cancelled() => {},
                        () = tokio::time::sleep(delay) => {},
                    }
                    req.retries_remaining -= 1;
                    req.priority += 10;
                    if self.frontier.admit_retry(req).await != Admission::Admitted {
                        warn!("retry re-admission was not admitted");
                    }
                    return None;
                }
                self.stats.record_exhausted();
                self.record_circuit_outcome(&req, false);
                self.signals
                    .send(SignalName::RequestFailed, &json!({"url": req.url, "error": err.to_string()}));
                Some(Response::retry_exhausted(req))
            },
        }
    }

    fn record_circuit_outcome(&self, req: &Request, success: bool) {
        let Some(host) = host_key(&req.url) else {
            return;
        };
        if success {
            self.circuits.record_success(&host);
        } else {
            self.circuits.record_failure(&host);
            if self.circuits.state_of(&host) == crate::circuit::CircuitState::Open {
                self.signals.send(SignalName::CircuitOpened, &json!({"host": host}));
            }
        }
    }

    /// One worker's loop: pull the next admitted request from `frontier`,
    /// honor the circuit breaker, fetch one attempt, and forward a
    /// terminal `Response` (if any) to the driver's dispatch stage. Runs
    /// until `cancel` fires.
    pub async fn worker_loop(
        self: Arc<Self>,
        frontier: Arc<Frontier>,
        cancel: CancellationToken,
        responses: tokio::sync::mpsc::Sender<Response>,
    ) {
        loop {
            let (req, ticket) = tokio::select! {
                _ = cancel.cancelled() => return,
                next = frontier.next() => next,
            };

            if let Some(host) = host_key(&req.url) {
                if !self.circuits.allow_request(&host) {
                    debug!(url = %req.url, "circuit open, skipping dispatch");
                    self.signals.send(
                        SignalName::RequestDropped,
                        &json!({"url": req.url, "reason": "circuit_open"}),
                    );
                    frontier.complete(ticket).await;
                    continue;
                }
            }

            let response = self.fetch(req, &cancel).await;
            frontier.complete(ticket).await;
            if let Some(response) = response
                && responses.send(response).await.is_err()
            {
                return;
            }
        }
    }
}

/// Transport errors (connect refused, DNS, TLS, timeout) all share one
/// retry budget, independent of the per-status-code table.
fn transport_max_retries() -> u32 {
    3
}
