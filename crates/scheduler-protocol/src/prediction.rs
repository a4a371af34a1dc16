use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-task-type learned duration state (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmaState {
    pub task_type: String,
    pub ema_duration_ms: f64,
    pub sample_count: u64,
    pub last_updated: DateTime<Utc>,
}

/// A single prediction returned by `HeuristicPredictor::predict`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPrediction {
    pub task_id: String,
    pub estimated_duration_ms: f64,
    pub confidence: f64,
    #[serde(default)]
    pub recommended_worker: Option<String>,
}

/// One rolling-window accuracy sample (spec.md §3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSample {
    pub task_type: String,
    pub predicted: f64,
    pub actual: f64,
    pub timestamp: DateTime<Utc>,
    pub within_threshold: bool,
}

/// The persisted blob written to the external key/value store
/// (spec.md §6): `{version, savedAt, predictions: {type: {ema, sampleCount, lastUpdated}}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionSnapshot {
    pub version: u8,
    #[serde(rename = "savedAt")]
    pub saved_at: DateTime<Utc>,
    pub predictions: HashMap<String, PersistedEmaState>,
}

/// The per-type shape inside the persistence envelope, field-named to
/// match spec.md §6's wire contract exactly (`ema`, `sampleCount`,
/// `lastUpdated`) independent of the in-memory `EmaState` field names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedEmaState {
    pub ema: f64,
    #[serde(rename = "sampleCount")]
    pub sample_count: u64,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl From<&EmaState> for PersistedEmaState {
    fn from(s: &EmaState) -> Self {
        Self {
            ema: s.ema_duration_ms,
            sample_count: s.sample_count,
            last_updated: s.last_updated,
        }
    }
}

impl EmaState {
    pub fn from_persisted(task_type: &str, p: &PersistedEmaState) -> Self {
        Self {
            task_type: task_type.to_string(),
            ema_duration_ms: p.ema,
            sample_count: p.sample_count,
            last_updated: p.last_updated,
        }
    }
}
