//! In-process pub/sub for lifecycle hooks (`request_scheduled`,
//! `response_received`, `circuit_opened`, `spider_idle`, ...). See
//! `SPEC_FULL.md` §4.5.
//!
//! Grounded on `examples/original_source/webants/signals.py`'s named-signal
//! dispatcher, re-expressed with the teacher's `Arc<dyn Fn(..) + Send +
//! Sync>` handler idiom (`src/handlers/dispatch.rs`) rather than a dynamic
//! string-keyed registry of `PyObject`s.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalName {
    SpiderOpened,
    SpiderClosed,
    SpiderIdle,
    RequestScheduled,
    RequestDropped,
    RequestReached,
    ResponseReceived,
    RequestFailed,
    CircuitOpened,
    CircuitClosed,
    ItemScraped,
    ItemDropped,
    ItemError,
}

/// Free-form payload handed to a handler; built per call site.
pub type SignalPayload = Value;

pub type Handler = Arc<dyn Fn(&SignalPayload) + Send + Sync>;

/// Ordered lists of handlers per signal. Each handler runs synchronously and
/// is isolated from its neighbors: a panic in one handler is caught so it
/// cannot take down the dispatching worker or skip the remaining handlers.
#[derive(Default)]
pub struct SignalBus {
    handlers: DashMap<SignalName, Vec<Handler>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, signal: SignalName, handler: Handler) {
        self.handlers.entry(signal).or_default().push(handler);
    }

    pub fn send(&self, signal: SignalName, payload: &SignalPayload) {
        let Some(handlers) = self.handlers.get(&signal) else {
            return;
        };
        for handler in handlers.iter() {
            let handler = handler.clone();
            let payload = payload.clone();
            if let Err(panic) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&payload)))
            {
                error!(?signal, ?panic, "signal handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn handlers_run_in_connect_order() {
        let bus = SignalBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let first = calls.clone();
        let second = calls.clone();
        bus.connect(
            SignalName::SpiderIdle,
            Arc::new(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.connect(
            SignalName::SpiderIdle,
            Arc::new(move |_| {
                second.fetch_add(10, Ordering::SeqCst);
            }),
        );
        bus.send(SignalName::SpiderIdle, &Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let bus = SignalBus::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        bus.connect(SignalName::CircuitOpened, Arc::new(|_| panic!("boom")));
        bus.connect(
            SignalName::CircuitOpened,
            Arc::new(move |_| {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.send(SignalName::CircuitOpened, &Value::Null);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unconnected_signal_is_a_noop() {
        let bus = SignalBus::new();
        bus.send(SignalName::CircuitClosed, &Value::Null);
    }
}
