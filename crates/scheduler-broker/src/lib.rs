//! Narrow interfaces to the external collaborators spec.md §1 places out
//! of scope: the durable task stream, the heartbeat and completion
//! streams, the per-worker dispatch channels, and the prediction
//! persistence store.
//!
//! Every trait here has exactly one real implementation (Redis, in
//! `redis_backend`) and one in-memory fake (`fake`) used by
//! `scheduler-core`'s test suite. Nothing in `scheduler-core` depends on
//! the Redis types directly — mirroring the teacher's
//! `VirtualMidiDevice` trait plus platform-specific implementations.

pub mod fake;
pub mod redis_backend;
pub mod traits;

pub use traits::{CompletionSource, DispatchSink, HeartbeatSource, PredictionStore, TaskSource};
