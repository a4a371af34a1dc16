//! Core scheduling engine: registry, predictor, scorer, fallback,
//! dispatcher, and feedback pipeline (spec.md §2).

pub mod availability;
pub mod breaker;
pub mod dispatcher;
pub mod ema;
pub mod fallback;
pub mod feedback;
pub mod heartbeat;
pub mod predictor;
pub mod registry;
pub mod scorer;

pub use breaker::CircuitBreaker;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use feedback::{CompletionSubscriber, FeedbackConfig};
pub use heartbeat::{HealthReaper, HeartbeatConfig, HeartbeatSubscriber};
pub use predictor::{HeuristicPredictor, NoOpPredictor, Predictor, PredictorConfig};
pub use registry::WorkerRegistry;
pub use scorer::ScoringConfig;
