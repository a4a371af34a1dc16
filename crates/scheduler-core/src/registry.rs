//! In-memory directory of workers (spec.md §2.5, §4.1). Single owner of
//! live `WorkerState`; every other component gets a cloned snapshot.
//! Single-writer expected (the heartbeat subscriber and its reaper);
//! readers observe a consistent per-query snapshot via the `RwLock`.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use scheduler_protocol::worker::{WorkerCapacity, WorkerState, WorkerStatus};
use tokio::sync::RwLock;

pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerState>>,
    capacities: RwLock<HashMap<String, WorkerCapacity>>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            capacities: RwLock::new(HashMap::new()),
            heartbeat_timeout,
        }
    }

    /// Workers are created on first registration or first heartbeat
    /// (spec.md §3 Lifecycle). Re-registering an id overwrites its state.
    pub async fn register(&self, worker: WorkerState) {
        self.workers.write().await.insert(worker.id.clone(), worker);
    }

    /// Explicit unregister. Removes from both maps.
    pub async fn unregister(&self, id: &str) -> Option<WorkerState> {
        self.capacities.write().await.remove(id);
        self.workers.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<WorkerState> {
        self.workers.read().await.get(id).cloned()
    }

    pub async fn get_capacity(&self, id: &str) -> Option<WorkerCapacity> {
        self.capacities.read().await.get(id).cloned()
    }

    pub async fn set_capacity(&self, id: &str, capacity: WorkerCapacity) {
        self.capacities.write().await.insert(id.to_string(), capacity);
    }

    /// Known-worker check; the heartbeat subscriber ignores telemetry
    /// for unknown workers (spec.md §4.3).
    pub async fn contains(&self, id: &str) -> bool {
        self.workers.read().await.contains_key(id)
    }

    pub async fn touch_heartbeat(&self, id: &str, at: DateTime<Utc>) -> bool {
        if let Some(w) = self.workers.write().await.get_mut(id) {
            w.last_heartbeat = at;
            true
        } else {
            false
        }
    }

    pub async fn set_status(&self, id: &str, status: WorkerStatus) -> bool {
        if let Some(w) = self.workers.write().await.get_mut(id) {
            w.status = status;
            true
        } else {
            false
        }
    }

    /// Load writes are clamped to `[0,1]` (spec.md §4.1). Returns the
    /// previous load so callers can gate "significant load change"
    /// event emission.
    pub async fn set_load(&self, id: &str, load: f64) -> Option<f64> {
        let mut workers = self.workers.write().await;
        let w = workers.get_mut(id)?;
        let previous = w.current_load;
        w.set_load_clamped(load);
        Some(previous)
    }

    pub async fn set_active_tasks(&self, id: &str, active_tasks: u32) -> bool {
        if let Some(w) = self.workers.write().await.get_mut(id) {
            w.active_tasks = active_tasks;
            true
        } else {
            false
        }
    }

    /// The subset that is simultaneously (a) not offline/draining,
    /// (b) within the heartbeat-timeout window, (c) below max
    /// concurrency, and (d) a superset of `required_capabilities`
    /// (spec.md §4.1).
    pub async fn available(&self, required_capabilities: &BTreeSet<String>) -> Vec<WorkerState> {
        let now = Utc::now();
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.status.is_eligible_status())
            .filter(|w| heartbeat_age(w.last_heartbeat, now) < self.heartbeat_timeout)
            .filter(|w| w.has_spare_capacity())
            .filter(|w| w.satisfies_capabilities(required_capabilities))
            .cloned()
            .collect()
    }

    /// Marks every worker whose last heartbeat is older than the
    /// heartbeat timeout as offline and returns their ids. Does not
    /// delete — deletion only happens through the heartbeat
    /// subscriber's removed-timeout path or `unregister`
    /// (spec.md §4.1).
    pub async fn reap(&self) -> Vec<String> {
        let now = Utc::now();
        let mut workers = self.workers.write().await;
        let mut reaped = Vec::new();
        for w in workers.values_mut() {
            if heartbeat_age(w.last_heartbeat, now) >= self.heartbeat_timeout
                && w.status != WorkerStatus::Offline
            {
                w.status = WorkerStatus::Offline;
                reaped.push(w.id.clone());
            }
        }
        reaped
    }

    /// Delete a worker from both maps without going through `reap`'s
    /// offline-marking path — used when a worker crosses the
    /// removed-timeout threshold (spec.md §4.3).
    pub async fn remove(&self, id: &str) {
        self.capacities.write().await.remove(id);
        self.workers.write().await.remove(id);
    }

    pub async fn all_ids(&self) -> Vec<String> {
        self.workers.read().await.keys().cloned().collect()
    }
}

fn heartbeat_age(last_heartbeat: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(last_heartbeat)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn registered_worker_is_available_when_idle_and_fresh() {
        let reg = registry();
        reg.register(WorkerState::new("w1", 4)).await;

        let available = reg.available(&BTreeSet::new()).await;
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, "w1");
    }

    #[tokio::test]
    async fn draining_and_offline_workers_are_excluded() {
        let reg = registry();
        let mut w = WorkerState::new("w1", 4);
        w.status = WorkerStatus::Draining;
        reg.register(w).await;

        assert!(reg.available(&BTreeSet::new()).await.is_empty());
    }

    #[tokio::test]
    async fn workers_at_max_concurrency_are_excluded() {
        let reg = registry();
        let mut w = WorkerState::new("w1", 2);
        w.active_tasks = 2;
        reg.register(w).await;

        assert!(reg.available(&BTreeSet::new()).await.is_empty());
    }

    #[tokio::test]
    async fn stale_heartbeat_excludes_a_worker_from_availability() {
        let reg = registry();
        let mut w = WorkerState::new("w1", 4);
        w.last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        reg.register(w).await;

        assert!(reg.available(&BTreeSet::new()).await.is_empty());
    }

    #[tokio::test]
    async fn reap_marks_stale_workers_offline_without_deleting_them() {
        let reg = registry();
        let mut w = WorkerState::new("w1", 4);
        w.last_heartbeat = Utc::now() - chrono::Duration::seconds(60);
        reg.register(w).await;

        let reaped = reg.reap().await;
        assert_eq!(reaped, vec!["w1".to_string()]);

        let w = reg.get("w1").await.unwrap();
        assert_eq!(w.status, WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn capability_superset_filter() {
        let reg = registry();
        let mut w = WorkerState::new("w1", 4);
        w.capabilities.insert("gpu".into());
        reg.register(w).await;

        let mut required = BTreeSet::new();
        required.insert("gpu".into());
        assert_eq!(reg.available(&required).await.len(), 1);

        required.insert("tpu".into());
        assert!(reg.available(&required).await.is_empty());
    }
}
