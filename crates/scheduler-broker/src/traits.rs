use std::time::Duration;

use async_trait::async_trait;
use scheduler_protocol::decision::DispatchEnvelope;
use scheduler_protocol::error::SchedulerError;
use scheduler_protocol::prediction::PredictionSnapshot;
use scheduler_protocol::task::RawTaskRecord;
use scheduler_protocol::worker::{CompletionRecord, HeartbeatRecord};

/// Consumer-group read from the durable task stream (spec.md §6).
/// Acknowledgment is per-message and gated on successful publish —
/// callers must not call `ack` until the corresponding dispatch
/// succeeded.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Read up to `max` records, blocking up to `block` when the stream
    /// is empty (spec.md §4.7 step 1).
    async fn read_batch(
        &self,
        max: usize,
        block: Duration,
    ) -> Result<Vec<RawTaskRecord>, SchedulerError>;

    /// Acknowledge a record by its broker-assigned id.
    async fn ack(&self, record_id: &str) -> Result<(), SchedulerError>;
}

/// One record pulled from the heartbeat stream, or a terminal signal.
/// Mirrors spec.md §6's `data`/`error`/`end` event hooks without
/// requiring a bespoke event-emitter type.
#[derive(Debug)]
pub enum HeartbeatEvent {
    Data(HeartbeatRecord),
    Error(String),
    End,
}

/// Abstract streaming source of worker telemetry (spec.md §4.3, §6).
#[async_trait]
pub trait HeartbeatSource: Send + Sync {
    /// Block until the next event is available.
    async fn next_event(&self) -> HeartbeatEvent;

    /// Cancel the upstream subscription. Idempotent.
    async fn cancel(&self);
}

/// Abstract streaming source of completion events (spec.md §4.8, §6).
#[async_trait]
pub trait CompletionSource: Send + Sync {
    async fn next(&self) -> Option<CompletionRecord>;
    async fn cancel(&self);
}

/// One channel per worker, named `"<prefix><workerId>"` (spec.md §6).
#[async_trait]
pub trait DispatchSink: Send + Sync {
    async fn publish(
        &self,
        worker_id: &str,
        envelope: &DispatchEnvelope,
    ) -> Result<(), SchedulerError>;
}

/// Single-key snapshot/load of predictor state (spec.md §4.4, §6).
/// Implementations must treat failures as non-fatal to the caller —
/// `HeuristicPredictor` downgrades any `Err` here to a logged warning.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    async fn save(&self, snapshot: &PredictionSnapshot) -> Result<(), SchedulerError>;
    async fn load(&self) -> Result<Option<PredictionSnapshot>, SchedulerError>;
}
