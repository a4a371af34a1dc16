//! In-memory fakes for the broker traits, used by `scheduler-core`'s
//! test suite in place of a live Redis instance. Mirrors the teacher's
//! `StubVirtualDevice` — same trait, deterministic in-process behavior.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use scheduler_protocol::decision::DispatchEnvelope;
use scheduler_protocol::error::SchedulerError;
use scheduler_protocol::prediction::PredictionSnapshot;
use scheduler_protocol::task::RawTaskRecord;
use scheduler_protocol::worker::CompletionRecord;

use crate::traits::{CompletionSource, DispatchSink, HeartbeatEvent, HeartbeatSource, PredictionStore, TaskSource};

/// A task source backed by a plain `Vec`. `read_batch` drains up to
/// `max` pending records and never blocks — tests don't need the 1s
/// empty-stream wait spec.md §4.7 specifies for the real broker.
#[derive(Default)]
pub struct FakeTaskSource {
    pending: Mutex<VecDeque<RawTaskRecord>>,
    acked: Mutex<Vec<String>>,
}

impl FakeTaskSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: RawTaskRecord) {
        self.pending.lock().unwrap().push_back(record);
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskSource for FakeTaskSource {
    async fn read_batch(&self, max: usize, _block: Duration) -> Result<Vec<RawTaskRecord>, SchedulerError> {
        let mut pending = self.pending.lock().unwrap();
        let mut out = Vec::new();
        while out.len() < max {
            match pending.pop_front() {
                Some(r) => out.push(r),
                None => break,
            }
        }
        Ok(out)
    }

    async fn ack(&self, record_id: &str) -> Result<(), SchedulerError> {
        self.acked.lock().unwrap().push(record_id.to_string());
        Ok(())
    }
}

/// A heartbeat source fed by pushing events directly; useful for
/// deterministic state-transition tests.
#[derive(Default)]
pub struct FakeHeartbeatSource {
    queue: tokio::sync::Mutex<VecDeque<HeartbeatEvent>>,
    cancelled: std::sync::atomic::AtomicBool,
}

impl FakeHeartbeatSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, event: HeartbeatEvent) {
        self.queue.lock().await.push_back(event);
    }
}

#[async_trait]
impl HeartbeatSource for FakeHeartbeatSource {
    async fn next_event(&self) -> HeartbeatEvent {
        if self.cancelled.load(std::sync::atomic::Ordering::Relaxed) {
            return HeartbeatEvent::End;
        }
        let mut queue = self.queue.lock().await;
        queue.pop_front().unwrap_or(HeartbeatEvent::End)
    }

    async fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

/// A completion source fed by pushing records directly.
#[derive(Default)]
pub struct FakeCompletionSource {
    queue: tokio::sync::Mutex<VecDeque<CompletionRecord>>,
    cancelled: std::sync::atomic::AtomicBool,
}

impl FakeCompletionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, record: CompletionRecord) {
        self.queue.lock().await.push_back(record);
    }
}

#[async_trait]
impl CompletionSource for FakeCompletionSource {
    async fn next(&self) -> Option<CompletionRecord> {
        if self.cancelled.load(std::sync::atomic::Ordering::Relaxed) {
            return None;
        }
        self.queue.lock().await.pop_front()
    }

    async fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Records every published envelope, keyed by worker id, in call order.
/// Tests assert both that a publish happened and what it contained.
#[derive(Default)]
pub struct FakeDispatchSink {
    published: Mutex<Vec<(String, DispatchEnvelope)>>,
    /// Worker ids that should fail the next publish (spec.md §8 scenario 5).
    fail_for: Mutex<std::collections::HashSet<String>>,
}

impl FakeDispatchSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_publish_to(&self, worker_id: &str) {
        self.fail_for.lock().unwrap().insert(worker_id.to_string());
    }

    pub fn published(&self) -> Vec<(String, DispatchEnvelope)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl DispatchSink for FakeDispatchSink {
    async fn publish(&self, worker_id: &str, envelope: &DispatchEnvelope) -> Result<(), SchedulerError> {
        if self.fail_for.lock().unwrap().remove(worker_id) {
            return Err(SchedulerError::PublishFailed {
                worker_id: worker_id.to_string(),
                source: "simulated publish failure".to_string(),
            });
        }
        self.published.lock().unwrap().push((worker_id.to_string(), envelope.clone()));
        Ok(())
    }
}

/// A prediction store backed by an in-process `Mutex<Option<..>>`.
/// `fail_io` forces every call to return `PersistenceUnavailable`,
/// exercising spec.md §4.9's "persistence unreachable" path.
#[derive(Default)]
pub struct FakePredictionStore {
    snapshot: Mutex<Option<PredictionSnapshot>>,
    fail_io: std::sync::atomic::AtomicBool,
}

impl FakePredictionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_io(&self, fail: bool) {
        self.fail_io.store(fail, std::sync::atomic::Ordering::Relaxed);
    }
}

#[async_trait]
impl PredictionStore for FakePredictionStore {
    async fn save(&self, snapshot: &PredictionSnapshot) -> Result<(), SchedulerError> {
        if self.fail_io.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(SchedulerError::PersistenceUnavailable("simulated outage".into()));
        }
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<PredictionSnapshot>, SchedulerError> {
        if self.fail_io.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(SchedulerError::PersistenceUnavailable("simulated outage".into()));
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }
}
