pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod prediction;
pub mod task;
pub mod worker;

/// Default Redis key holding the persisted predictor snapshot.
pub const DEFAULT_PREDICTION_KEY: &str = "scheduler:predictions";

/// Persistence envelope format version (spec.md §6).
pub const PREDICTION_SNAPSHOT_VERSION: u8 = 1;
