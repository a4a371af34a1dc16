//! Heartbeat subscriber and periodic reaper (spec.md §2.6, §4.3).
//! Single-writer onto the registry: this module and its reaper are the
//! only code paths that mutate `WorkerState`/`WorkerCapacity` once a
//! worker exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scheduler_broker::{HeartbeatEvent, HeartbeatSource};
use scheduler_protocol::events::WorkerEvent;
use scheduler_protocol::worker::{HeartbeatRecord, WorkerCapacity, WorkerHealth, WorkerState};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::availability;
use crate::registry::WorkerRegistry;

/// A worker id seen for the first time on a heartbeat is registered
/// with this provisional concurrency. Formal registration is an
/// out-of-scope control-plane concern (spec.md §1); an explicit
/// `WorkerRegistry::register` call through that surface overrides it.
const PROVISIONAL_MAX_CONCURRENCY: u32 = 10;

/// Bounded so a slow event consumer cannot make this subscriber's
/// channel grow without limit (spec.md §9 "Event emission").
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct HeartbeatConfig {
    pub heartbeat_timeout: Duration,
    pub unhealthy_timeout: Duration,
    pub removed_timeout: Duration,
    pub health_check_interval: Duration,
    pub avg_task_duration_ms: f64,
}

/// Consumes a `HeartbeatSource`, updating the registry and capacity
/// map and emitting `WorkerEvent`s on health-class transitions or
/// significant load changes (spec.md §4.3).
pub struct HeartbeatSubscriber {
    registry: Arc<WorkerRegistry>,
    config: HeartbeatConfig,
    events: mpsc::Sender<WorkerEvent>,
    last_health: Arc<Mutex<HashMap<String, WorkerHealth>>>,
}

impl HeartbeatSubscriber {
    /// `last_health` is shared with the `HealthReaper` constructed
    /// alongside this subscriber so the two independent tasks agree on
    /// each worker's last-reported health and never double-emit a
    /// transition (spec.md §4.3 "emitted exactly once per transition").
    pub fn new(
        registry: Arc<WorkerRegistry>,
        config: HeartbeatConfig,
        last_health: Arc<Mutex<HashMap<String, WorkerHealth>>>,
    ) -> (Self, mpsc::Receiver<WorkerEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { registry, config, events: tx, last_health }, rx)
    }

    pub fn events_sender(&self) -> mpsc::Sender<WorkerEvent> {
        self.events.clone()
    }

    /// Runs until the source signals `End`. An unknown worker id is
    /// ignored (spec.md §4.3 "if unknown, ignore" — except a worker is
    /// never unknown here since we bootstrap it provisionally; kept as
    /// a defensive no-op path in case a future registration surface
    /// races the registry).
    pub async fn run(&self, source: Arc<dyn HeartbeatSource>) {
        loop {
            match source.next_event().await {
                HeartbeatEvent::Data(record) => self.handle_heartbeat(record).await,
                HeartbeatEvent::Error(err) => warn!(error = %err, "heartbeat stream reported an error"),
                HeartbeatEvent::End => {
                    debug!("heartbeat stream ended, subscriber stopping");
                    break;
                }
            }
        }
    }

    async fn handle_heartbeat(&self, record: HeartbeatRecord) {
        if !self.registry.contains(&record.worker_id).await {
            self.registry
                .register(WorkerState::new(record.worker_id.clone(), PROVISIONAL_MAX_CONCURRENCY))
                .await;
        }

        let now = Utc::now();
        self.registry.touch_heartbeat(&record.worker_id, now).await;

        let load = availability::current_load(record.cpu_usage, record.memory_usage);
        let previous_load = self.registry.set_load(&record.worker_id, load).await.unwrap_or(load);

        let capacity = WorkerCapacity {
            queue_depth: record.queue_depth,
            estimated_free_at: availability::estimated_free_at(
                now,
                record.queue_depth,
                self.config.avg_task_duration_ms,
            ),
            health: availability::classify_health(
                Duration::ZERO,
                load,
                self.config.unhealthy_timeout,
                self.config.removed_timeout,
            ),
            rolling_avg_task_duration_ms: self.config.avg_task_duration_ms,
        };
        self.registry.set_capacity(&record.worker_id, capacity.clone()).await;

        self.maybe_emit_health_transition(&record.worker_id, capacity.health, now).await;
        if availability::is_significant_load_change(previous_load, load) {
            self.send(WorkerEvent::WorkerLoadChanged { worker_id: record.worker_id, load, at: now }).await;
        }
    }

    async fn maybe_emit_health_transition(&self, worker_id: &str, health: WorkerHealth, at: chrono::DateTime<Utc>) {
        let changed = {
            let mut last = self.last_health.lock().await;
            let changed = last.get(worker_id) != Some(&health);
            last.insert(worker_id.to_string(), health);
            changed
        };
        if !changed {
            return;
        }
        let event = match health {
            WorkerHealth::Healthy => WorkerEvent::WorkerHealthy { worker_id: worker_id.to_string(), at },
            WorkerHealth::Degraded => WorkerEvent::WorkerDegraded { worker_id: worker_id.to_string(), at },
            WorkerHealth::Unhealthy => WorkerEvent::WorkerUnhealthy { worker_id: worker_id.to_string(), at },
            WorkerHealth::Removed => WorkerEvent::WorkerRemoved { worker_id: worker_id.to_string(), at },
        };
        self.send(event).await;
    }

    async fn send(&self, event: WorkerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("worker event receiver dropped, discarding event");
        }
    }
}

/// Runs independently of the heartbeat subscriber (spec.md §4.3,
/// §5 "independent task"). Every `healthCheckIntervalMs`, forces
/// `offline` on workers past the unhealthy timeout (emitting
/// `unhealthy` exactly once per transition via the shared
/// `last_health` map) and deletes workers past the removed timeout
/// (emitting `removed` exactly once, then dropping them from both
/// maps).
pub struct HealthReaper {
    registry: Arc<WorkerRegistry>,
    config: HeartbeatConfig,
    events: mpsc::Sender<WorkerEvent>,
    last_health: Arc<Mutex<HashMap<String, WorkerHealth>>>,
    stopped: AtomicBool,
}

impl HealthReaper {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        config: HeartbeatConfig,
        events: mpsc::Sender<WorkerEvent>,
        last_health: Arc<Mutex<HashMap<String, WorkerHealth>>>,
    ) -> Self {
        Self { registry, config, events, last_health, stopped: AtomicBool::new(false) }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.tick().await;
        loop {
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }
            ticker.tick().await;
            self.sweep().await;
        }
    }

    async fn sweep(&self) {
        let offline = self.registry.reap().await;
        for worker_id in offline {
            self.transition_if_changed(&worker_id, WorkerHealth::Unhealthy).await;
        }

        let now = Utc::now();
        for worker_id in self.registry.all_ids().await {
            let Some(worker) = self.registry.get(&worker_id).await else { continue };
            let age = now
                .signed_duration_since(worker.last_heartbeat)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age >= self.config.removed_timeout {
                self.registry.remove(&worker_id).await;
                self.last_health.lock().await.remove(&worker_id);
                self.emit(WorkerEvent::WorkerRemoved { worker_id, at: now }).await;
                info!("worker removed after exceeding the removed-timeout window");
            }
        }
    }

    async fn transition_if_changed(&self, worker_id: &str, health: WorkerHealth) {
        let changed = {
            let mut last = self.last_health.lock().await;
            let changed = last.get(worker_id) != Some(&health);
            last.insert(worker_id.to_string(), health);
            changed
        };
        if changed {
            self.emit(WorkerEvent::WorkerUnhealthy { worker_id: worker_id.to_string(), at: Utc::now() }).await;
        }
    }

    async fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("worker event receiver dropped, discarding event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_broker::fake::FakeHeartbeatSource;
    use scheduler_protocol::worker::HeartbeatRecord;
    use std::sync::Arc;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            heartbeat_timeout: Duration::from_secs(30),
            unhealthy_timeout: Duration::from_secs(30),
            removed_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_millis(50),
            avg_task_duration_ms: 5000.0,
        }
    }

    #[tokio::test]
    async fn unknown_worker_is_bootstrapped_on_first_heartbeat() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let (subscriber, mut rx) = HeartbeatSubscriber::new(Arc::clone(&registry), config(), Arc::new(Mutex::new(HashMap::new())));

        subscriber
            .handle_heartbeat(HeartbeatRecord {
                worker_id: "w1".into(),
                cpu_usage: 0.2,
                memory_usage: 0.2,
                queue_depth: 0,
                timestamp_ms: 0,
            })
            .await;

        assert!(registry.contains("w1").await);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, WorkerEvent::WorkerHealthy { .. }));
    }

    #[tokio::test]
    async fn health_transition_emits_exactly_once() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let (subscriber, mut rx) = HeartbeatSubscriber::new(Arc::clone(&registry), config(), Arc::new(Mutex::new(HashMap::new())));

        let heartbeat = |cpu: f64| HeartbeatRecord {
            worker_id: "w1".into(),
            cpu_usage: cpu,
            memory_usage: 0.0,
            queue_depth: 0,
            timestamp_ms: 0,
        };

        subscriber.handle_heartbeat(heartbeat(0.5)).await;
        assert!(matches!(rx.recv().await.unwrap(), WorkerEvent::WorkerHealthy { .. }));

        subscriber.handle_heartbeat(heartbeat(0.95)).await;
        let next = rx.try_recv();
        assert!(matches!(next, Ok(WorkerEvent::WorkerDegraded { .. }) | Ok(WorkerEvent::WorkerLoadChanged { .. })));
    }

    #[tokio::test]
    async fn run_consumes_until_end_event() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let (subscriber, _rx) = HeartbeatSubscriber::new(Arc::clone(&registry), config(), Arc::new(Mutex::new(HashMap::new())));
        let source = Arc::new(FakeHeartbeatSource::new());
        source
            .push(HeartbeatEvent::Data(HeartbeatRecord {
                worker_id: "w1".into(),
                cpu_usage: 0.1,
                memory_usage: 0.1,
                queue_depth: 0,
                timestamp_ms: 0,
            }))
            .await;
        source.push(HeartbeatEvent::End).await;

        subscriber.run(source).await;
        assert!(registry.contains("w1").await);
    }
}
