//! Heuristic duration predictor (spec.md §2.3, §4.4). Owns
//! `Map<taskType, EmaState>` entirely in memory, backed by an external
//! snapshot/restore path through the `PredictionStore` trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_broker::PredictionStore;
use scheduler_protocol::prediction::{EmaState, PersistedEmaState, PredictionSnapshot, TaskPrediction};
use scheduler_protocol::task::Task;
use scheduler_protocol::PREDICTION_SNAPSHOT_VERSION;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::ema;

/// Tagged interface over predictor strategies (spec.md §9 "Dynamic
/// polymorphism"). The dispatcher and the completion subscriber depend
/// on this trait, not on `HeuristicPredictor` directly, so a future
/// strategy can be substituted without touching either call site.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, task: &Task) -> TaskPrediction;

    async fn feedback(&self, task_type: &str, actual_duration_ms: f64);

    /// Cheap liveness probe; never does I/O. `HeuristicPredictor` is
    /// always ready once constructed (warm start never fails the
    /// predictor itself — see `HeuristicPredictor::new`).
    fn ready(&self) -> bool {
        true
    }

    /// Last known `(emaDurationMs, sampleCount)` for a task type, if
    /// this strategy tracks per-type state. Used only by the feedback
    /// pipeline's `PredictionUpdated` event; strategies that don't
    /// track per-type state (e.g. `NoOpPredictor`) return `None`.
    async fn current_state(&self, _task_type: &str) -> Option<(f64, u64)> {
        None
    }
}

/// The identity element for `Predictor`: always predicts the
/// configured default with zero confidence and never learns
/// (spec.md §9). Used for tests and as a bootstrap placeholder before
/// a real predictor is wired in.
pub struct NoOpPredictor {
    default_duration_ms: f64,
}

impl NoOpPredictor {
    pub fn new(default_duration_ms: f64) -> Self {
        Self { default_duration_ms }
    }
}

impl Default for NoOpPredictor {
    fn default() -> Self {
        Self::new(5000.0)
    }
}

#[async_trait]
impl Predictor for NoOpPredictor {
    async fn predict(&self, task: &Task) -> TaskPrediction {
        TaskPrediction {
            task_id: task.id.clone(),
            estimated_duration_ms: self.default_duration_ms,
            confidence: 0.0,
            recommended_worker: None,
        }
    }

    async fn feedback(&self, _task_type: &str, _actual_duration_ms: f64) {}
}

pub struct PredictorConfig {
    pub alpha: f64,
    pub confidence_threshold: u64,
    pub default_duration_ms: f64,
    pub snapshot_interval: u64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self { alpha: 0.3, confidence_threshold: 100, default_duration_ms: 5000.0, snapshot_interval: 100 }
    }
}

pub struct HeuristicPredictor {
    states: RwLock<HashMap<String, EmaState>>,
    store: Arc<dyn PredictionStore>,
    config: PredictorConfig,
    updates_since_snapshot: AtomicU64,
}

impl HeuristicPredictor {
    /// Warm start: attempt a load from persistence; on failure, log and
    /// continue with an empty map. Persistence failures are never
    /// fatal for predict (spec.md §4.4, §4.9).
    pub async fn new(store: Arc<dyn PredictionStore>, config: PredictorConfig) -> Self {
        let states = match store.load().await {
            Ok(Some(snapshot)) => {
                info!(types = snapshot.predictions.len(), "restored predictor state from persistence");
                snapshot
                    .predictions
                    .iter()
                    .map(|(task_type, persisted)| (task_type.clone(), EmaState::from_persisted(task_type, persisted)))
                    .collect()
            }
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "predictor warm start failed, continuing with empty state");
                HashMap::new()
            }
        };

        Self {
            states: RwLock::new(states),
            store,
            config,
            updates_since_snapshot: AtomicU64::new(0),
        }
    }

    /// O(1) lookup, no I/O, expected to complete in well under 1ms
    /// (spec.md §4.4). Worker selection is not the predictor's
    /// responsibility: `recommended_worker` is always `None` here.
    pub async fn predict(&self, task: &Task) -> TaskPrediction {
        let states = self.states.read().await;
        match states.get(&task.task_type) {
            Some(state) => TaskPrediction {
                task_id: task.id.clone(),
                estimated_duration_ms: state.ema_duration_ms,
                confidence: ema::confidence(state.sample_count, self.config.confidence_threshold),
                recommended_worker: None,
            },
            None => TaskPrediction {
                task_id: task.id.clone(),
                estimated_duration_ms: self.config.default_duration_ms,
                confidence: 0.0,
                recommended_worker: None,
            },
        }
    }

    /// Fold one completion's actual duration into the task type's EMA,
    /// then persist every `snapshot_interval` updates (spec.md §4.4).
    pub async fn feedback(&self, task_type: &str, actual_duration_ms: f64) {
        {
            let mut states = self.states.write().await;
            match states.get_mut(task_type) {
                Some(state) => {
                    state.ema_duration_ms = ema::update_ema(Some(state.ema_duration_ms), actual_duration_ms, self.config.alpha);
                    state.sample_count += 1;
                    state.last_updated = Utc::now();
                }
                None => {
                    states.insert(
                        task_type.to_string(),
                        EmaState {
                            task_type: task_type.to_string(),
                            ema_duration_ms: actual_duration_ms,
                            sample_count: 1,
                            last_updated: Utc::now(),
                        },
                    );
                }
            }
        }

        let count = self.updates_since_snapshot.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.config.snapshot_interval {
            self.updates_since_snapshot.store(0, Ordering::Relaxed);
            self.persist().await;
        }
    }

    /// Current `(emaDurationMs, sampleCount)` for a task type, if any
    /// feedback has been recorded for it yet. Used by the feedback
    /// pipeline to report a `PredictionUpdated` event without re-running
    /// `predict`'s default-duration fallback logic.
    pub async fn current_state(&self, task_type: &str) -> Option<(f64, u64)> {
        let states = self.states.read().await;
        states.get(task_type).map(|s| (s.ema_duration_ms, s.sample_count))
    }

    /// Final persist on clean shutdown (spec.md §4.4).
    pub async fn shutdown(&self) {
        self.persist().await;
    }

    /// Operator reset (spec.md §3 Lifecycle): clear one task type, or
    /// the whole map when `task_type` is `None`, and persist the
    /// cleared state immediately.
    pub async fn reset(&self, task_type: Option<&str>) {
        {
            let mut states = self.states.write().await;
            match task_type {
                Some(t) => {
                    states.remove(t);
                }
                None => states.clear(),
            }
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let predictions: HashMap<String, PersistedEmaState> = {
            let states = self.states.read().await;
            states.iter().map(|(k, v)| (k.clone(), PersistedEmaState::from(v))).collect()
        };
        let snapshot = PredictionSnapshot {
            version: PREDICTION_SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            predictions,
        };
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(error = %e, "predictor snapshot persist failed, continuing in-memory only");
        }
    }
}

#[async_trait]
impl Predictor for HeuristicPredictor {
    async fn predict(&self, task: &Task) -> TaskPrediction {
        HeuristicPredictor::predict(self, task).await
    }

    async fn feedback(&self, task_type: &str, actual_duration_ms: f64) {
        HeuristicPredictor::feedback(self, task_type, actual_duration_ms).await
    }

    async fn current_state(&self, task_type: &str) -> Option<(f64, u64)> {
        HeuristicPredictor::current_state(self, task_type).await
    }
}
