use thiserror::Error;

/// Every failure mode the scheduler can produce, grouped by the recovery
/// path a caller takes (spec.md §7). None of these are used for normal
/// control flow — a fallback path always consumes its own error locally
/// before a `SchedulerError` reaches the dispatch result.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The predictor returned an error, or a prediction referencing a
    /// worker that is no longer eligible. Recovered by fallback; counted
    /// toward the circuit breaker.
    #[error("predictor unavailable: {0}")]
    PredictorUnavailable(String),

    /// No worker survived the eligibility filter, including fallback.
    #[error("no workers available")]
    NoWorkersAvailable,

    /// A stream record could not be parsed into a `Task`. The poison
    /// message is acknowledged rather than retried.
    #[error("malformed task payload: {reason}")]
    MalformedTask { reason: String },

    /// Publish to a worker's dispatch channel failed. The stream message
    /// is left unacknowledged so the broker redelivers it.
    #[error("publish to worker {worker_id} failed: {source}")]
    PublishFailed { worker_id: String, source: String },

    /// The task stream could not be read. Callers log and retry.
    #[error("stream read failed: {0}")]
    StreamRead(String),

    /// The persistence store could not be reached. Never fatal — the
    /// predictor keeps serving from memory.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// A configuration value failed validation before reaching the hot
    /// loop (e.g. scorer weights not summing to 1).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
