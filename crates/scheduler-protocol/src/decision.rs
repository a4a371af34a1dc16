use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prediction::TaskPrediction;

/// Why a worker was chosen (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Prediction,
    FallbackRoundRobin,
    FallbackCircuitBreaker,
}

impl DecisionReason {
    pub fn used_fallback(self) -> bool {
        !matches!(self, DecisionReason::Prediction)
    }
}

/// The outcome of scoring or falling back for one task (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingDecision {
    pub task_id: String,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub used_fallback: bool,
    pub reason: DecisionReason,
    #[serde(default)]
    pub prediction: Option<TaskPrediction>,
}

impl SchedulingDecision {
    pub fn new(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        reason: DecisionReason,
        prediction: Option<TaskPrediction>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            timestamp: Utc::now(),
            used_fallback: reason.used_fallback(),
            reason,
            prediction,
        }
    }
}

/// Process-local, ephemeral breaker state (spec.md §3). Snapshots of
/// this are not required to be consistent across scheduler processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub open: bool,
}

/// The envelope published on a worker's dispatch channel
/// (spec.md §6: `{taskId, task, assignedAt}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEnvelope {
    pub task_id: String,
    pub task: crate::task::Task,
    pub assigned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_reason_never_used_fallback() {
        assert!(!DecisionReason::Prediction.used_fallback());
        assert!(DecisionReason::FallbackRoundRobin.used_fallback());
        assert!(DecisionReason::FallbackCircuitBreaker.used_fallback());
    }
}
