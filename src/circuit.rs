//! Per-host circuit breaker: closed → open → half-open → closed. See
//! `SPEC_FULL.md` §4.4.
//!
//! Grounded on `examples/original_source/webants/downloader.py`'s
//! consecutive-failure counter and cooldown window, and on the teacher's
//! `DashMap`-as-registry idiom (`src/client/pool_sessions.rs`). Unlike the
//! frontier's `HostEntry`, critical sections here never hold an `.await`
//! point, so a bare `DashMap<String, HostCircuit>` is enough; there is no
//! need for a nested `Mutex` per entry.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::cfg::config::SpiderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct HostCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for HostCircuit {
    fn default() -> Self {
        Self { state: CircuitState::Closed, consecutive_failures: 0, opened_at: None }
    }
}

/// Tracks one circuit per host, admitting or refusing dispatch before a
/// fetch is attempted.
pub struct CircuitRegistry {
    hosts: DashMap<String, HostCircuit>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitRegistry {
    pub fn new(cfg: &SpiderConfig) -> Self {
        Self {
            hosts: DashMap::new(),
            failure_threshold: cfg.failure_threshold,
            recovery_timeout: cfg.recovery_timeout,
        }
    }

    /// Whether a new request against `host` may be dispatched right now. An
    /// open circuit past its recovery timeout transitions to half-open and
    /// allows exactly this one probe through.
    pub fn allow_request(&self, host: &str) -> bool {
        let mut entry = self.hosts.entry(host.to_string()).or_default();
        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.recovery_timeout {
                    entry.state = CircuitState::HalfOpen;
                    info!(host, "circuit half-open: probing");
                    true
                } else {
                    false
                }
            },
        }
    }

    pub fn record_success(&self, host: &str) {
        if let Some(mut entry) = self.hosts.get_mut(host) {
            if entry.state != CircuitState::Closed {
                info!(host, "circuit closed after successful probe");
            }
            entry.state = CircuitState::Closed;
            entry.consecutive_failures = 0;
            entry.opened_at = None;
        }
    }

    pub fn record_failure(&self, host: &str) {
        let mut entry = self.hosts.entry(host.to_string()).or_default();
        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                warn!(host, "probe failed, circuit re-opened");
            },
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Instant::now());
                    warn!(host, failures = entry.consecutive_failures, "circuit opened");
                }
            },
            CircuitState::Open => {},
        }
    }

    pub fn state_of(&self, host: &str) -> CircuitState {
        self.hosts.get(host).map(|e| e.state).unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(threshold: u32, recovery: Duration) -> SpiderConfig {
        SpiderConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
            retry_sweep_interval: Duration::from_secs(30),
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let reg = CircuitRegistry::new(&cfg(3, Duration::from_secs(60)));
        assert!(reg.allow_request("a.com"));
        reg.record_failure("a.com");
        reg.record_failure("a.com");
        assert_eq!(reg.state_of("a.com"), CircuitState::Closed);
        reg.record_failure("a.com");
        assert_eq!(reg.state_of("a.com"), CircuitState::Open);
        assert!(!reg.allow_request("a.com"));
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let reg = CircuitRegistry::new(&cfg(1, Duration::ZERO));
        reg.record_failure("a.com");
        assert_eq!(reg.state_of("a.com"), CircuitState::Open);
        assert!(reg.allow_request("a.com"));
        assert_eq!(reg.state_of("a.com"), CircuitState::HalfOpen);
        reg.record_failure("a.com");
        assert_eq!(reg.state_of("a.com"), CircuitState::Open);
    }

    #[test]
    fn success_closes_circuit() {
        let reg = CircuitRegistry::new(&cfg(1, Duration::ZERO));
        reg.record_failure("a.com");
        assert!(reg.allow_request("a.com"));
        reg.record_success("a.com");
        assert_eq!(reg.state_of("a.com"), CircuitState::Closed);
    }
}
