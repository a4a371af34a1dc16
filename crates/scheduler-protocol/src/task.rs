use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of work read off the task stream.
///
/// `id` is unique within the in-flight set; `task_type` is the stable key
/// the predictor learns against and must be non-empty whenever feedback is
/// expected for this task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Task {
    /// Priority clamped at `max_priority` (spec.md §3: "saturating at
    /// configured max").
    pub fn clamped_priority(&self, max_priority: u32) -> u32 {
        self.priority.min(max_priority)
    }
}

/// The raw record as read from the task stream, before parsing into a
/// `Task`. Kept separate so a malformed record can be logged with its
/// original stream id without requiring a successfully-parsed `Task`.
#[derive(Debug, Clone)]
pub struct RawTaskRecord {
    /// Broker-assigned id used for acknowledgment (e.g. a Redis Streams
    /// entry id), distinct from `Task::id`.
    pub record_id: String,
    pub fields: std::collections::HashMap<String, String>,
}
