//! Circuit breaker guarding the predictor (spec.md §2.9, §4.7, §9).
//! Owned exclusively by the dispatcher; mutated only from its loop, so
//! a plain `std::sync::Mutex` is enough (never awaited while held).

use std::sync::Mutex;

use chrono::Utc;
use scheduler_protocol::decision::CircuitBreakerState;

pub struct CircuitBreaker {
    state: Mutex<CircuitBreakerState>,
    fallback_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(fallback_threshold: u32) -> Self {
        Self { state: Mutex::new(CircuitBreakerState::default()), fallback_threshold }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.state.lock().unwrap().clone()
    }

    /// `closed -> open` on the N-th consecutive predictor failure
    /// (N = `fallback_threshold`) (spec.md §4.7).
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        state.last_failure = Some(Utc::now());
        if state.consecutive_failures >= self.fallback_threshold {
            state.open = true;
        }
    }

    /// `open -> closed` on any successful prediction; resets every
    /// field (spec.md §4.7, §8 invariant
    /// `consecutiveFailures = 0 <=> open = false`).
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        *state = CircuitBreakerState::default();
    }

    /// Design Notes §9, Open Question: the source breaker has no
    /// explicit half-open state, so once open it never closes on its
    /// own in steady-state failure. This implementation adopts policy
    /// (A) — the dispatcher does not call this automatically — but
    /// exposes it for an operator or a future periodic-probe task to
    /// force the one attempt that can close the breaker again. It does
    /// not itself close the breaker; only `record_success` does, after
    /// that forced attempt succeeds. If the forced attempt fails,
    /// `record_failure` immediately re-opens it since
    /// `consecutive_failures` was never cleared.
    pub fn force_probe(&self) {
        self.state.lock().unwrap().open = false;
    }
}
