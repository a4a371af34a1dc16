//! Integration tests for the scheduler-protocol crate.
//!
//! These exercise the public data model and config types across module
//! boundaries: task/worker invariants, the persistence envelope's JSON
//! shape, and config validation end to end.

use std::collections::BTreeSet;

use chrono::Utc;
use scheduler_protocol::config::SchedulerConfig;
use scheduler_protocol::decision::{DecisionReason, SchedulingDecision};
use scheduler_protocol::prediction::{EmaState, PersistedEmaState, PredictionSnapshot};
use scheduler_protocol::task::Task;
use scheduler_protocol::worker::{WorkerState, WorkerStatus};

#[test]
fn decision_reason_determines_used_fallback_flag() {
    let prediction_decision = SchedulingDecision::new("t1", "w1", DecisionReason::Prediction, None);
    assert!(!prediction_decision.used_fallback);

    let fallback_decision =
        SchedulingDecision::new("t1", "w2", DecisionReason::FallbackCircuitBreaker, None);
    assert!(fallback_decision.used_fallback);
}

#[test]
fn prediction_snapshot_round_trips_through_json() {
    let mut predictions = std::collections::HashMap::new();
    predictions.insert(
        "encode".to_string(),
        PersistedEmaState { ema: 1234.5, sample_count: 7, last_updated: Utc::now() },
    );
    let snapshot = PredictionSnapshot { version: 1, saved_at: Utc::now(), predictions };

    let json = serde_json::to_string(&snapshot).unwrap();
    let decoded: PredictionSnapshot = serde_json::from_str(&json).unwrap();

    assert_eq!(decoded, snapshot);
    let restored = EmaState::from_persisted("encode", &decoded.predictions["encode"]);
    assert_eq!(restored.ema_duration_ms, 1234.5);
    assert_eq!(restored.sample_count, 7);
}

#[test]
fn worker_eligibility_combines_status_capacity_and_capabilities() {
    let mut w = WorkerState::new("w1", 2);
    w.status = WorkerStatus::Idle;
    w.active_tasks = 1;
    w.capabilities.insert("gpu".into());

    assert!(w.status.is_eligible_status());
    assert!(w.has_spare_capacity());

    let mut required = BTreeSet::new();
    required.insert("gpu".into());
    assert!(w.satisfies_capabilities(&required));

    w.active_tasks = 2;
    assert!(!w.has_spare_capacity());
}

#[test]
fn config_with_bad_weights_fails_validation_before_the_hot_loop() {
    let toml_src = r#"
        [weights]
        wait = 0.9
        load = 0.9
        priority = 0.2
    "#;
    let cfg: SchedulerConfig = toml::from_str(toml_src).unwrap();
    assert!(cfg.validate().is_err());
}

#[test]
fn task_payload_deserializes_from_stream_shaped_json() {
    let json = serde_json::json!({
        "id": "task-1",
        "type": "render",
        "priority": 7,
        "createdAt": Utc::now().to_rfc3339(),
        "payload": {"scene": "intro.blend"},
    });
    let task: Task = serde_json::from_value(json).unwrap();
    assert_eq!(task.task_type, "render");
    assert_eq!(task.clamped_priority(5), 5);
}
