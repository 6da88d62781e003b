// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Instant;

/// Per-host pacing state owned by the frontier. `SPEC_FULL.md` §3 also lists
/// `consecutive_failures`/`circuit_state`/`opened_at` on `HostState`; this
/// crate keeps those fields in `crate::circuit::CircuitRegistry` instead, so
/// the circuit registry can use its own lock per `SPEC_FULL.md` §5
/// ("the circuit registry uses its own mutex") without the frontier and the
/// breaker fighting over one struct's lock. Both are keyed by the same
/// canonical hostname.
#[derive(Debug, Clone)]
pub struct HostState {
    pub inflight: u32,
    pub last_dispatch: Option<Instant>,
    /// EWMA of inter-dispatch intervals, seconds, alpha = 0.2.
    pub ewma_interval_secs: f64,
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            inflight: 0,
            last_dispatch: None,
            ewma_interval_secs: 0.0,
            min_interval_secs: f64::INFINITY,
            max_interval_secs: 0.0,
        }
    }
}

impl HostState {
    pub const EWMA_ALPHA: f64 = 0.2;

    /// Folds a newly measured inter-dispatch interval into the running EWMA
    /// and min/max.
    pub fn observe_interval(&mut self, measured_secs: f64) {
        if self.last_dispatch.is_some() {
            self.ewma_interval_secs =
                Self::EWMA_ALPHA * measured_secs + (1.0 - Self::EWMA_ALPHA) * self.ewma_interval_secs;
            self.min_interval_secs = self.min_interval_secs.min(measured_secs);
            self.max_interval_secs = self.max_interval_secs.max(measured_secs);
        }
    }
}
