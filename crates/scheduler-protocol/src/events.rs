use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State-transition events emitted by the heartbeat subscriber
/// (spec.md §4.3, §9 "Event emission"). Delivered on a bounded channel
/// so a slow listener cannot create unbounded fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    WorkerHealthy { worker_id: String, at: DateTime<Utc> },
    WorkerDegraded { worker_id: String, at: DateTime<Utc> },
    WorkerUnhealthy { worker_id: String, at: DateTime<Utc> },
    WorkerRemoved { worker_id: String, at: DateTime<Utc> },
    WorkerLoadChanged { worker_id: String, load: f64, at: DateTime<Utc> },
}

/// Severity of a detected prediction/actual drift (spec.md §4.8, §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    Minor,
    Major,
}

/// Events emitted by the completion/feedback pipeline (spec.md §4.8,
/// §9 "Event emission").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedbackEvent {
    DriftDetected {
        task_type: String,
        predicted: f64,
        actual: f64,
        severity: DriftSeverity,
        at: DateTime<Utc>,
    },
    PredictionUpdated {
        task_type: String,
        ema_duration_ms: f64,
        sample_count: u64,
        at: DateTime<Utc>,
    },
    AccuracyWarning {
        window_size: usize,
        accuracy: f64,
        at: DateTime<Utc>,
    },
}
