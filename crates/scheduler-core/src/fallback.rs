//! Deterministic fallback scheduling (spec.md §2.8, §4.6), used when
//! prediction is unavailable or the circuit breaker is open.

use std::sync::atomic::{AtomicUsize, Ordering};

use scheduler_protocol::decision::{DecisionReason, SchedulingDecision};
use scheduler_protocol::worker::WorkerState;

/// Round-robin cursor over the eligible-worker list, recomputed each
/// call under the current capability filter (spec.md §4.6). The list
/// itself is supplied by the caller (typically
/// `WorkerRegistry::available`); this only owns the rotating position.
pub struct FallbackScheduler {
    cursor: AtomicUsize,
}

impl Default for FallbackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackScheduler {
    pub fn new() -> Self {
        Self { cursor: AtomicUsize::new(0) }
    }

    /// Advances the cursor modulo the candidate list length; an empty
    /// list returns no-decision (spec.md §4.6).
    pub fn round_robin(
        &self,
        task_id: &str,
        candidates: &[WorkerState],
        reason: DecisionReason,
    ) -> Option<SchedulingDecision> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(SchedulingDecision::new(task_id, candidates[idx].id.clone(), reason, None))
    }
}

/// Sorts eligible workers ascending by `(currentLoad, activeTasks /
/// maxConcurrency)` and picks the first, breaking exact ties by worker
/// id for determinism (spec.md §4.6).
pub fn lowest_load(
    task_id: &str,
    candidates: &[WorkerState],
    reason: DecisionReason,
) -> Option<SchedulingDecision> {
    candidates
        .iter()
        .min_by(|a, b| {
            let key_a = (a.current_load, a.active_tasks as f64 / a.max_concurrency as f64);
            let key_b = (b.current_load, b.active_tasks as f64 / b.max_concurrency as f64);
            key_a
                .partial_cmp(&key_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|w| SchedulingDecision::new(task_id, w.id.clone(), reason, None))
}
