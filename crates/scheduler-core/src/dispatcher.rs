//! The dispatcher loop: consume → predict → score → publish → ack
//! (spec.md §2.9, §4.7). Owns the circuit breaker; everything else it
//! touches is a shared, independently-owned collaborator.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scheduler_broker::{DispatchSink, TaskSource};
use scheduler_protocol::decision::{DecisionReason, DispatchEnvelope, SchedulingDecision};
use scheduler_protocol::error::SchedulerError;
use scheduler_protocol::prediction::TaskPrediction;
use scheduler_protocol::task::{RawTaskRecord, Task};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::fallback::FallbackScheduler;
use crate::predictor::Predictor;
use crate::registry::WorkerRegistry;
use crate::scorer::{self, ScoringConfig};

pub struct DispatcherConfig {
    /// Max records pulled per `read_batch` call (spec.md §4.7 step 1).
    pub batch_size: usize,
    /// Blocks up to this long when the stream is empty (spec.md §4.7
    /// step 1: "block up to 1s").
    pub block: Duration,
    /// Upper bound on a single `predictor.predict` call; the predictor
    /// is in-process and expected to return in well under 1ms, so this
    /// only fires under pathological lock contention. A timeout is
    /// treated the same as a predictor exception (spec.md §4.7 "on
    /// predictor exception").
    pub predictor_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { batch_size: 16, block: Duration::from_secs(1), predictor_timeout: Duration::from_millis(50) }
    }
}

pub struct Dispatcher {
    source: Arc<dyn TaskSource>,
    sink: Arc<dyn DispatchSink>,
    registry: Arc<WorkerRegistry>,
    predictor: Arc<dyn Predictor>,
    breaker: Arc<CircuitBreaker>,
    fallback: FallbackScheduler,
    scoring_config: ScoringConfig,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn TaskSource>,
        sink: Arc<dyn DispatchSink>,
        registry: Arc<WorkerRegistry>,
        predictor: Arc<dyn Predictor>,
        breaker: Arc<CircuitBreaker>,
        scoring_config: ScoringConfig,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            source,
            sink,
            registry,
            predictor,
            breaker,
            fallback: FallbackScheduler::new(),
            scoring_config,
            config,
        }
    }

    /// Runs until `shutdown` is set to `true`. Each loop iteration reads
    /// one batch and processes it to completion before checking for
    /// shutdown again, so an in-flight batch always finishes cleanly.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                result = self.source.read_batch(self.config.batch_size, self.config.block) => result,
            };

            match batch {
                Ok(records) => {
                    for record in records {
                        self.handle_record(record).await;
                    }
                }
                Err(e) => warn!(error = %e, "task stream read failed, retrying"),
            }
        }
    }

    async fn handle_record(&self, record: RawTaskRecord) {
        let task = match parse_task(&record, self.scoring_config.max_priority) {
            Ok(task) => task,
            Err(reason) => {
                warn!(record_id = %record.record_id, reason = %reason, "dropping malformed task");
                if let Err(e) = self.source.ack(&record.record_id).await {
                    warn!(error = %e, "failed to ack malformed task record");
                }
                return;
            }
        };

        match self.dispatch_task(&task).await {
            Ok(decision) => {
                debug!(
                    task_id = %task.id,
                    worker_id = %decision.worker_id,
                    reason = ?decision.reason,
                    "dispatched task"
                );
                if let Err(e) = self.source.ack(&record.record_id).await {
                    warn!(error = %e, task_id = %task.id, "failed to ack dispatched task");
                }
            }
            Err(SchedulerError::PublishFailed { worker_id, source }) => {
                warn!(
                    task_id = %task.id,
                    worker_id,
                    error = %source,
                    "publish failed, leaving unacknowledged for redelivery"
                );
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "dispatch failed");
            }
        }
    }

    /// The `dispatchTask` protocol (spec.md §4.7). Ack is the caller's
    /// responsibility; this only ever publishes.
    async fn dispatch_task(&self, task: &Task) -> Result<SchedulingDecision, SchedulerError> {
        let candidates = self.registry.available(&task.required_capabilities).await;
        let decision = self.decide(task, &candidates).await?;

        let envelope = DispatchEnvelope { task_id: task.id.clone(), task: task.clone(), assigned_at: Utc::now() };
        self.sink.publish(&decision.worker_id, &envelope).await?;
        Ok(decision)
    }

    async fn decide(
        &self,
        task: &Task,
        candidates: &[scheduler_protocol::worker::WorkerState],
    ) -> Result<SchedulingDecision, SchedulerError> {
        if !self.breaker.is_open() {
            match tokio::time::timeout(self.config.predictor_timeout, self.predictor.predict(task)).await {
                Ok(prediction) => {
                    // An empty candidate pool (spec.md §7 kind 3: "no
                    // eligible workers") is not a predictor failure — it
                    // falls through to the fallback without touching the
                    // breaker. Only a timed-out predictor call counts
                    // toward it (kind 1: "transient predictor failure").
                    if let Some(result) = scorer::score(task, candidates, Some(&prediction), &self.scoring_config) {
                        self.breaker.record_success();
                        let prediction = TaskPrediction { recommended_worker: Some(result.best_worker_id.clone()), ..prediction };
                        return Ok(SchedulingDecision::new(
                            &task.id,
                            result.best_worker_id,
                            DecisionReason::Prediction,
                            Some(prediction),
                        ));
                    }
                }
                Err(_) => {
                    warn!(task_id = %task.id, "predictor call timed out");
                    self.breaker.record_failure();
                }
            }
        }

        let reason =
            if self.breaker.is_open() { DecisionReason::FallbackCircuitBreaker } else { DecisionReason::FallbackRoundRobin };
        self.fallback
            .round_robin(&task.id, candidates, reason)
            .ok_or(SchedulerError::NoWorkersAvailable)
    }
}

/// Parses the task stream's record fields into a `Task` (spec.md §6:
/// `id`, `type`, `payload` (JSON-encoded), `priority` (integer string),
/// `createdAt` (RFC-3339), optional `metadata` (JSON) carrying
/// `requiredCapabilities`/`maxRetries`/`timeoutMs`). Any missing or
/// unparseable required field is a malformed record (spec.md §4.7
/// step 2: drop with an error log and ack). `priority` is saturated at
/// `max_priority` here (spec.md §3), so every `Task` reaching the rest
/// of the engine already holds an in-range value.
fn parse_task(record: &RawTaskRecord, max_priority: u32) -> Result<Task, String> {
    let field = |name: &str| record.fields.get(name).ok_or_else(|| format!("missing {name} field"));

    let id = field("id")?.clone();
    let task_type = field("type")?.clone();
    let priority: u32 = field("priority")?.parse().map_err(|e| format!("priority is not an integer: {e}"))?;
    let created_at = chrono::DateTime::parse_from_rfc3339(field("createdAt")?)
        .map_err(|e| format!("createdAt is not RFC-3339: {e}"))?
        .with_timezone(&Utc);

    let payload = match record.fields.get("payload") {
        Some(raw) if !raw.is_empty() => {
            serde_json::from_str(raw).map_err(|e| format!("payload is not valid JSON: {e}"))?
        }
        _ => serde_json::Value::Null,
    };

    let metadata: TaskMetadata = match record.fields.get("metadata") {
        Some(raw) if !raw.is_empty() => {
            serde_json::from_str(raw).map_err(|e| format!("metadata is not valid JSON: {e}"))?
        }
        _ => TaskMetadata::default(),
    };

    let mut task = Task {
        id,
        task_type,
        priority,
        created_at,
        payload,
        required_capabilities: metadata.required_capabilities,
        max_retries: metadata.max_retries,
        timeout_ms: metadata.timeout_ms,
    };
    task.priority = task.clamped_priority(max_priority);
    Ok(task)
}

/// Optional sidecar carried in the task stream's `metadata` field; none
/// of spec.md §6's required fields live here.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskMetadata {
    #[serde(default)]
    required_capabilities: std::collections::BTreeSet<String>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::HeuristicPredictor;
    use scheduler_broker::fake::{FakeDispatchSink, FakeTaskSource};
    use scheduler_protocol::config::ScorerWeights;
    use scheduler_protocol::worker::WorkerState;
    use std::collections::HashMap;

    fn scoring_config() -> ScoringConfig {
        ScoringConfig { weights: ScorerWeights::default(), max_wait_ms: 60_000.0, max_priority: 10 }
    }

    fn task_record(id: &str, task_type: &str) -> RawTaskRecord {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), id.to_string());
        fields.insert("type".to_string(), task_type.to_string());
        fields.insert("priority".to_string(), "1".to_string());
        fields.insert("createdAt".to_string(), Utc::now().to_rfc3339());
        fields.insert("payload".to_string(), "{}".to_string());
        RawTaskRecord { record_id: format!("{id}-0"), fields }
    }

    async fn dispatcher_with(
        registry: Arc<WorkerRegistry>,
    ) -> (Dispatcher, Arc<FakeTaskSource>, Arc<FakeDispatchSink>) {
        let source = Arc::new(FakeTaskSource::new());
        let sink = Arc::new(FakeDispatchSink::new());
        let store = Arc::new(scheduler_broker::fake::FakePredictionStore::new());
        let predictor: Arc<dyn Predictor> = Arc::new(HeuristicPredictor::new(store, Default::default()).await);
        let breaker = Arc::new(CircuitBreaker::new(3));
        let dispatcher = Dispatcher::new(
            source.clone() as Arc<dyn TaskSource>,
            sink.clone() as Arc<dyn DispatchSink>,
            registry,
            predictor,
            breaker,
            scoring_config(),
            DispatcherConfig::default(),
        );
        (dispatcher, source, sink)
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_and_acked() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let (dispatcher, source, sink) = dispatcher_with(registry).await;

        let mut bad = task_record("t1", "x");
        bad.fields.insert("payload".to_string(), "not json".to_string());
        source.push(bad);

        let batch = source.read_batch(10, Duration::ZERO).await.unwrap();
        for record in batch {
            dispatcher.handle_record(record).await;
        }

        assert_eq!(source.acked(), vec!["t1-0".to_string()]);
        assert!(sink.published().is_empty());
    }

    #[tokio::test]
    async fn successful_dispatch_acks_and_publishes() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        registry.register(WorkerState::new("w1", 4)).await;
        let (dispatcher, source, sink) = dispatcher_with(registry).await;

        source.push(task_record("t1", "encode"));
        let batch = source.read_batch(10, Duration::ZERO).await.unwrap();
        for record in batch {
            dispatcher.handle_record(record).await;
        }

        assert_eq!(source.acked(), vec!["t1-0".to_string()]);
        assert_eq!(sink.published().len(), 1);
        assert_eq!(sink.published()[0].0, "w1");
    }

    #[tokio::test]
    async fn publish_failure_leaves_the_record_unacknowledged() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        registry.register(WorkerState::new("w1", 4)).await;
        let (dispatcher, source, sink) = dispatcher_with(registry).await;
        sink.fail_next_publish_to("w1");

        source.push(task_record("t1", "encode"));
        let batch = source.read_batch(10, Duration::ZERO).await.unwrap();
        for record in batch {
            dispatcher.handle_record(record).await;
        }

        assert!(source.acked().is_empty());
    }

    #[tokio::test]
    async fn no_eligible_workers_yields_no_ack_and_no_publish() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let (dispatcher, source, sink) = dispatcher_with(registry).await;

        source.push(task_record("t1", "encode"));
        let batch = source.read_batch(10, Duration::ZERO).await.unwrap();
        for record in batch {
            dispatcher.handle_record(record).await;
        }

        assert!(source.acked().is_empty());
        assert!(sink.published().is_empty());
    }

    /// A predictor that sleeps past whatever `predictor_timeout` the
    /// dispatcher is configured with, so every `decide()` call hits the
    /// timeout branch deterministically.
    struct SlowPredictor {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl Predictor for SlowPredictor {
        async fn predict(&self, task: &Task) -> scheduler_protocol::prediction::TaskPrediction {
            tokio::time::sleep(self.delay).await;
            scheduler_protocol::prediction::TaskPrediction {
                task_id: task.id.clone(),
                estimated_duration_ms: 1000.0,
                confidence: 0.0,
                recommended_worker: None,
            }
        }
        async fn feedback(&self, _task_type: &str, _actual_duration_ms: f64) {}
    }

    fn bare_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            task_type: "encode".into(),
            priority: 1,
            created_at: Utc::now(),
            payload: serde_json::json!({}),
            required_capabilities: Default::default(),
            max_retries: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn no_eligible_workers_never_trips_the_breaker() {
        // Empty candidate pool is spec.md §7 kind 3 ("no eligible
        // workers"), distinct from a predictor failure, and must not
        // count toward the breaker even after many dispatch attempts.
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let (dispatcher, _source, _sink) = dispatcher_with(registry).await;

        for i in 0..10 {
            let result = dispatcher.dispatch_task(&bare_task(&format!("t{i}"))).await;
            assert!(matches!(result, Err(SchedulerError::NoWorkersAvailable)));
        }

        assert!(!dispatcher.breaker.is_open());
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_predictor_timeouts_and_fallback_is_flagged() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        registry.register(WorkerState::new("w1", 4)).await;
        let source = Arc::new(FakeTaskSource::new());
        let sink = Arc::new(FakeDispatchSink::new());
        let predictor: Arc<dyn Predictor> = Arc::new(SlowPredictor { delay: Duration::from_millis(20) });
        let breaker = Arc::new(CircuitBreaker::new(3));
        let dispatcher = Dispatcher::new(
            source.clone() as Arc<dyn TaskSource>,
            sink.clone() as Arc<dyn DispatchSink>,
            Arc::clone(&registry),
            predictor,
            Arc::clone(&breaker),
            scoring_config(),
            DispatcherConfig { predictor_timeout: Duration::from_millis(1), ..DispatcherConfig::default() },
        );

        for i in 0..3 {
            let decision = dispatcher.dispatch_task(&bare_task(&format!("t{i}"))).await.unwrap();
            assert_eq!(decision.reason, if i < 2 { DecisionReason::FallbackRoundRobin } else { DecisionReason::FallbackCircuitBreaker });
        }

        assert!(breaker.is_open());
    }
}
