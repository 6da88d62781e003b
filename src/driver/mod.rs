//! The spider driver: couples seeds, the frontier, the downloader workers,
//! and the user's callbacks into one run loop, with circuit-breaking and
//! graceful shutdown. See `SPEC_FULL.md` §4.5.
//!
//! Grounded on `examples/original_source/webants/engine.py`'s
//! `Engine.start`/`_next_request` control loop for the seed → schedule →
//! fetch → parse → re-schedule cycle, and on the teacher's
//! `src/client/session.rs` graceful-quiesce pattern (one `CancellationToken`
//! shared by every worker, `wait_inflight_drained` before returning) for
//! `Spider::stop`.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod signal;

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    cfg::config::{SchedulerConfig, SpiderConfig},
    circuit::CircuitRegistry,
    downloader::{Downloader, transport::Transport},
    driver::signal::{SignalBus, SignalName},
    frontier::{Admission, Frontier},
    model::{CallbackItem, Request, Response, Sink, fingerprint_request},
    stats::Stats,
    url::host_key,
};

/// Owns the full run: frontier, downloader, circuit breaker, signals, and
/// the persistence sink a crawl's callbacks feed into.
pub struct Spider {
    frontier: Arc<Frontier>,
    downloader: Arc<Downloader>,
    circuits: Arc<CircuitRegistry>,
    signals: Arc<SignalBus>,
    stats: Arc<Stats>,
    sink: Arc<dyn Sink>,
    cancel: CancellationToken,
    worker_count: usize,
    retry_sweep_interval: std::time::Duration,
    /// Requests that terminated with the synthetic retry-exhausted response,
    /// re-admitted on the periodic sweep. Keyed by fingerprint so a request
    /// already back in the frontier is not queued twice.
    failed: DashMap<[u8; 20], Request>,
}

impl Spider {
    pub fn new(
        scheduler_cfg: &SchedulerConfig,
        spider_cfg: &SpiderConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn Sink>,
        downloader_cfg: &crate::cfg::config::DownloaderConfig,
        worker_count: usize,
    ) -> Self {
        let circuits = Arc::new(CircuitRegistry::new(spider_cfg));
        let signals = Arc::new(SignalBus::new());
        let stats = Arc::new(Stats::default());
        let frontier = Arc::new(Frontier::new(scheduler_cfg.clone(), signals.clone()));
        let downloader = Arc::new(Downloader::new(
            downloader_cfg,
            transport,
            frontier.clone(),
            circuits.clone(),
            signals.clone(),
            stats.clone(),
        ));
        Self {
            frontier,
            downloader,
            circuits,
            signals,
            stats,
            sink,
            cancel: CancellationToken::new(),
            worker_count,
            retry_sweep_interval: spider_cfg.retry_sweep_interval,
            failed: DashMap::new(),
        }
    }

    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.signals
    }

    pub async fn stats(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot().await
    }

    /// Admits the initial set of seed requests before the run loop starts.
    pub async fn seed(&self, requests: Vec<Request>) {
        for req in requests {
            match self.frontier.admit(req).await {
                Admission::Admitted => {},
                Admission::Filtered => {},
                Admission::Rejected { reason } => warn!(reason, "seed request rejected"),
            }
        }
    }

    /// Runs workers, the response-dispatch stage, and the retry sweep until
    /// the frontier drains and no retry work remains, or `stop()` is called.
    pub async fn run(&self) -> Result<()> {
        self.signals.send(SignalName::SpiderOpened, &json!({}));
        let (tx, mut rx) = mpsc::channel::<Response>(self.worker_count.max(1) * 4);

        let mut worker_handles = Vec::with_capacity(self.worker_count);
        for _ in 0..self.worker_count {
            let downloader = self.downloader.clone();
            let frontier = self.frontier.clone();
            let cancel = self.cancel.clone();
            let tx = tx.clone();
            worker_handles.push(tokio::spawn(downloader.worker_loop(frontier, cancel, tx)));
        }
        drop(tx);

        let mut sweep = tokio::time::interval(self.retry_sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sweep.tick() => self.sweep_failed().await,
                maybe_resp = rx.recv() => {
                    match maybe_resp {
                        Some(resp) => self.dispatch(resp).await,
                        None => break,
                    }
                }
            }
        }

        self.cancel.cancel();
        for handle in worker_handles {
            let _ = handle.await;
        }
        self.signals.send(SignalName::SpiderIdle, &json!({}));
        self.signals.send(SignalName::SpiderClosed, &json!({}));
        Ok(())
    }

    /// Requests a graceful stop: workers finish their in-flight fetch, the
    /// run loop drains the channel, then `run()` returns.
    pub fn stop(&self) {
        info!("stop requested, draining in-flight work");
        self.cancel.cancel();
    }

    async fn dispatch(&self, resp: Response) {
        if resp.is_retry_exhausted() {
            let fp = fingerprint_request(&resp.request);
            warn!(url = %resp.request.url, "retries exhausted, queued for periodic retry sweep");
            self.failed.insert(fp, resp.request.clone());
            if let Some(errback) = resp.request.errback.clone() {
                errback(&anyhow::anyhow!("retries exhausted"), &resp.request);
            }
            return;
        }

        let Some(callback) = resp.request.callback.clone() else {
            return;
        };
        let spider_failed = &self.failed;
        let frontier = self.frontier.clone();
        let sink = self.sink.clone();
        let status = resp.status;
        let url = resp.url.clone();
        let errback = resp.request.errback.clone();
        let req_for_errback = resp.request.clone();

        match callback(resp).await {
            Ok(items) => {
                for item in items {
                    match item {
                        CallbackItem::Request(req) => {
                            let fp = fingerprint_request(&req);
                            spider_failed.remove(&fp);
                            if let Admission::Rejected { reason } = frontier.admit(req).await {
                                warn!(reason, "follow-up request rejected");
                            }
                        },
                        CallbackItem::Record(record) => {
                            if self.cancel.is_cancelled() {
                                self.signals.send(
                                    SignalName::ItemDropped,
                                    &json!({"url": url, "reason": "shutting_down"}),
                                );
                            } else {
                                match sink.save(record).await {
                                    Ok(()) => {
                                        self.signals.send(SignalName::ItemScraped, &json!({"url": url}));
                                    },
                                    Err(err) => {
                                        error!(%err, url, status, "sink.save failed");
                                        self.signals.send(
                                            SignalName::ItemError,
                                            &json!({"url": url, "error": err.to_string()}),
                                        );
                                    },
                                }
                            }
                        },
                    }
                }
            },
            Err(err) => {
                error!(%err, url, status, "callback returned an error");
                if let Some(errback) = errback {
                    errback(&err, &req_for_errback);
                }
            },
        }
    }

    async fn sweep_failed(&self) {
        if self.failed.is_empty() {
            return;
        }
        let pending: Vec<_> = self.failed.iter().map(|e| (*e.key(), e.value().clone())).collect();
        for (fp, req) in pending {
            let host = host_key(&req.url);
            let allowed = host.as_deref().is_none_or(|h| self.circuits.allow_request(h));
            if !allowed {
                self.signals.send(
                    SignalName::RequestDropped,
                    &json!({"url": req.url, "reason": "circuit_open"}),
                );
                continue;
            }
            if self.frontier.admit_retry(req).await == Admission::Admitted {
                self.failed.remove(&fp);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub stats: crate::stats::StatsSnapshot,
    pub unresolved_failures: usize,
}
