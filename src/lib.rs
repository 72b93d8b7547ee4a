//! # stagepipe
//!
//! Bounded-concurrency two-stage work pipeline.
//!
//! Items flow through a compute-bound transform stage and an I/O-bound
//! persist stage, connected by bounded queues that provide backpressure.
//! Only the persist stage is retried, with exponential backoff and jitter.
//! Shutdown drains the queues in order instead of aborting tasks, and a
//! shared cancellation token is observed at every suspension point.

pub mod capability;
pub mod config;
pub mod counters;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod retry;
pub mod telemetry;
