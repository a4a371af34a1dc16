//! Pure functions mapping telemetry fields to load, health class, and
//! estimated-free-at (spec.md §2.2, §4.2). No I/O, no shared state.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use scheduler_protocol::worker::WorkerHealth;

/// Alpha for the per-worker rolling average task duration
/// (spec.md §4.2).
pub const ROLLING_AVG_ALPHA: f64 = 0.1;

/// `0.6*cpu + 0.4*mem`, both inputs clamped to `[0,1]` first
/// (spec.md §4.2).
pub fn current_load(cpu_usage: f64, memory_usage: f64) -> f64 {
    0.6 * cpu_usage.clamp(0.0, 1.0) + 0.4 * memory_usage.clamp(0.0, 1.0)
}

/// `now + queueDepth * avgTaskDuration` (spec.md §4.2). Always `>= now`
/// since `queue_depth` and `avg_task_duration_ms` are non-negative.
pub fn estimated_free_at(now: DateTime<Utc>, queue_depth: u32, avg_task_duration_ms: f64) -> DateTime<Utc> {
    let wait_ms = (queue_depth as f64 * avg_task_duration_ms).max(0.0);
    now + ChronoDuration::milliseconds(wait_ms.round() as i64)
}

/// Health classification, evaluated in the order spec.md §4.2 specifies:
/// removed-timeout, then unhealthy-timeout, then load, else healthy.
pub fn classify_health(
    heartbeat_age: std::time::Duration,
    current_load: f64,
    unhealthy_timeout: std::time::Duration,
    removed_timeout: std::time::Duration,
) -> WorkerHealth {
    if heartbeat_age >= removed_timeout {
        WorkerHealth::Removed
    } else if heartbeat_age >= unhealthy_timeout {
        WorkerHealth::Unhealthy
    } else if current_load >= 0.9 {
        WorkerHealth::Degraded
    } else {
        WorkerHealth::Healthy
    }
}

/// Gate for event emission: only significant load swings are reported
/// (spec.md §4.2, §4.3).
pub fn is_significant_load_change(previous: f64, new: f64) -> bool {
    (new - previous).abs() >= 0.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn current_load_weights_cpu_over_memory() {
        assert!((current_load(1.0, 0.0) - 0.6).abs() < 1e-9);
        assert!((current_load(0.0, 1.0) - 0.4).abs() < 1e-9);
        assert!((current_load(0.5, 0.5) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn current_load_clamps_out_of_range_inputs() {
        assert!((current_load(1.5, -0.5) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn estimated_free_at_is_never_before_now() {
        let now = Utc::now();
        assert_eq!(estimated_free_at(now, 0, 5000.0), now);
        assert!(estimated_free_at(now, 3, 5000.0) > now);
    }

    #[test]
    fn healthy_when_fresh_and_under_load_threshold() {
        let health = classify_health(
            Duration::from_secs(1),
            0.5,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        assert_eq!(health, WorkerHealth::Healthy);
    }

    #[test]
    fn degraded_when_load_is_at_or_above_0_9() {
        let health = classify_health(
            Duration::from_secs(1),
            0.9,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        assert_eq!(health, WorkerHealth::Degraded);
    }

    #[test]
    fn unhealthy_beyond_the_unhealthy_timeout() {
        let health = classify_health(
            Duration::from_secs(31),
            0.0,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        assert_eq!(health, WorkerHealth::Unhealthy);
    }

    #[test]
    fn removed_beyond_the_removed_timeout_even_if_load_looks_fine() {
        let health = classify_health(
            Duration::from_secs(301),
            0.0,
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        assert_eq!(health, WorkerHealth::Removed);
    }

    #[test]
    fn load_change_gate() {
        assert!(!is_significant_load_change(0.50, 0.55));
        assert!(is_significant_load_change(0.50, 0.61));
    }
}
