use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a worker (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Draining,
    Offline,
}

impl WorkerStatus {
    /// A worker in either of these statuses is never eligible for
    /// dispatch (spec.md §3 invariant).
    pub fn is_eligible_status(self) -> bool {
        !matches!(self, WorkerStatus::Offline | WorkerStatus::Draining)
    }
}

/// Health classification derived from heartbeat age and load
/// (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Removed,
}

/// Live, mutable state for one worker. Owned exclusively by the
/// `WorkerRegistry`; every other component sees a cloned snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: String,
    pub status: WorkerStatus,
    pub capabilities: BTreeSet<String>,
    pub current_load: f64,
    pub active_tasks: u32,
    pub max_concurrency: u32,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerState {
    pub fn new(id: impl Into<String>, max_concurrency: u32) -> Self {
        Self {
            id: id.into(),
            status: WorkerStatus::Idle,
            capabilities: BTreeSet::new(),
            current_load: 0.0,
            active_tasks: 0,
            max_concurrency,
            last_heartbeat: Utc::now(),
        }
    }

    /// `active_tasks <= max_concurrency` is a data model invariant; this
    /// is the read side other components use to filter candidates.
    pub fn has_spare_capacity(&self) -> bool {
        self.active_tasks < self.max_concurrency
    }

    /// A worker passes the capability filter only if its capability set
    /// is a superset of the task's required set.
    pub fn satisfies_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Load writes are clamped to [0,1] (spec.md §4.1).
    pub fn set_load_clamped(&mut self, load: f64) {
        self.current_load = load.clamp(0.0, 1.0);
    }
}

/// Derived capacity/health snapshot for a worker (spec.md §3, §4.2).
/// Recomputed on every heartbeat by the availability calculator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapacity {
    pub queue_depth: u32,
    pub estimated_free_at: DateTime<Utc>,
    pub health: WorkerHealth,
    pub rolling_avg_task_duration_ms: f64,
}

/// One heartbeat telemetry record, as read from the heartbeat stream
/// (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub worker_id: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub queue_depth: u32,
    pub timestamp_ms: i64,
}

/// One completion event, as read from the completion stream
/// (spec.md §4.8, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub task_id: String,
    pub task_type: String,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub predicted_duration_ms: Option<f64>,
}
