//! Multi-objective scorer (spec.md §2.7, §4.5). Pure per-decision
//! function: no I/O, no shared state, deterministic given its inputs.

use scheduler_protocol::config::ScorerWeights;
use scheduler_protocol::prediction::TaskPrediction;
use scheduler_protocol::task::Task;
use scheduler_protocol::worker::WorkerState;

pub struct ScoringConfig {
    pub weights: ScorerWeights,
    pub max_wait_ms: f64,
    pub max_priority: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerScore {
    pub worker_id: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct ScoringResult {
    pub best_worker_id: String,
    pub score: f64,
    pub reasoning: String,
    /// Every candidate's score, sorted best-first, ties broken by
    /// worker id (spec.md §4.5 "deterministic ... stable ordering").
    pub alternatives: Vec<WorkerScore>,
}

fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

/// Score one candidate worker for a task. Exposed separately from
/// `score` so the fallback scheduler's lowest-load variant can reuse
/// the same load definition without re-deriving it.
fn score_worker(
    task: &Task,
    worker: &WorkerState,
    predicted_duration_ms: f64,
    config: &ScoringConfig,
) -> f64 {
    let estimated_wait = worker.active_tasks as f64 * predicted_duration_ms;
    let wait_score = 1.0 - clamp(estimated_wait, 0.0, config.max_wait_ms) / config.max_wait_ms;
    let load_score = 1.0 - clamp(worker.current_load, 0.0, 1.0);
    let priority_score = clamp(task.priority as f64, 0.0, config.max_priority as f64) / config.max_priority as f64;

    config.weights.wait * wait_score + config.weights.load * load_score + config.weights.priority * priority_score
}

/// Score every eligible candidate and pick the best, breaking ties by
/// worker id so repeated calls on equal inputs yield the same choice
/// (spec.md §4.5). `candidates` is assumed already filtered for
/// eligibility (status, capacity, capability) by the caller — an empty
/// slice here means "no eligible worker" and yields `None`.
pub fn score(
    task: &Task,
    candidates: &[WorkerState],
    prediction: Option<&TaskPrediction>,
    config: &ScoringConfig,
) -> Option<ScoringResult> {
    if candidates.is_empty() {
        return None;
    }

    let predicted_duration_ms = prediction.map(|p| p.estimated_duration_ms).unwrap_or(5000.0);

    let mut scored: Vec<WorkerScore> = candidates
        .iter()
        .map(|w| WorkerScore {
            worker_id: w.id.clone(),
            score: score_worker(task, w, predicted_duration_ms, config),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.worker_id.cmp(&b.worker_id))
    });

    let best = scored.first()?.clone();
    Some(ScoringResult {
        reasoning: format!(
            "selected {} with score {:.4} among {} eligible candidates (predicted_duration_ms={predicted_duration_ms:.1})",
            best.worker_id,
            best.score,
            scored.len()
        ),
        best_worker_id: best.worker_id,
        score: best.score,
        alternatives: scored,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn task(priority: u32) -> Task {
        Task {
            id: "t1".into(),
            task_type: "encode".into(),
            priority,
            created_at: chrono::Utc::now(),
            payload: serde_json::json!({}),
            required_capabilities: BTreeSet::new(),
            max_retries: None,
            timeout_ms: None,
        }
    }

    fn config() -> ScoringConfig {
        ScoringConfig {
            weights: ScorerWeights { wait: 0.4, load: 0.4, priority: 0.2 },
            max_wait_ms: 60_000.0,
            max_priority: 10,
        }
    }

    #[test]
    fn empty_candidate_list_yields_no_decision() {
        assert!(score(&task(1), &[], None, &config()).is_none());
    }

    #[test]
    fn prefers_the_worker_with_lower_load_and_fewer_active_tasks() {
        let mut idle = WorkerState::new("idle", 4);
        idle.current_load = 0.1;

        let mut busy = WorkerState::new("busy", 4);
        busy.current_load = 0.9;
        busy.active_tasks = 3;

        let result = score(&task(5), &[idle, busy], None, &config()).unwrap();
        assert_eq!(result.best_worker_id, "idle");
    }

    #[test]
    fn ties_break_deterministically_by_worker_id() {
        let a = WorkerState::new("a", 4);
        let b = WorkerState::new("b", 4);

        let result = score(&task(5), &[b.clone(), a.clone()], None, &config()).unwrap();
        assert_eq!(result.best_worker_id, "a");

        // Stable across repeated calls with identical inputs.
        let result2 = score(&task(5), &[b, a], None, &config()).unwrap();
        assert_eq!(result2.best_worker_id, "a");
    }

    #[test]
    fn every_sub_score_in_unit_interval_keeps_total_score_in_unit_interval() {
        let mut w = WorkerState::new("w1", 10);
        w.current_load = 0.5;
        w.active_tasks = 2;

        let prediction = TaskPrediction {
            task_id: "t1".into(),
            estimated_duration_ms: 1000.0,
            confidence: 0.8,
            recommended_worker: None,
        };

        let result = score(&task(7), &[w], Some(&prediction), &config()).unwrap();
        assert!((0.0..=1.0).contains(&result.score));
    }
}
