//! Pipeline engine: worker pools, outcome aggregation, metrics reporting,
//! and the shutdown coordinator that ties them together.
//!
//! ```text
//! producer -> transform queue -> transform pool -> persist queue -> persist pool (retry)
//!                                      |                                  |
//!                                      +---------> outcome queue <--------+
//!                                                       |
//!                                                   aggregator
//! ```

pub mod aggregator;
pub mod coordinator;
pub mod persist;
pub mod reporter;
pub mod transform;

pub use coordinator::{Pipeline, RunHandle, RunReport};
pub use reporter::{MetricsSnapshot, QueueGauge};

use crate::error::{Error, Result};
use crate::model::{Outcome, WorkItem};
use crate::queue::BoundedQueue;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;

pub type ItemQueue = BoundedQueue<Arc<WorkItem>>;
pub type OutcomeQueue = BoundedQueue<Outcome>;

/// Sizing and policy for one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub transform_workers: usize,
    pub persist_workers: usize,
    pub transform_queue_capacity: usize,
    pub persist_queue_capacity: usize,
    pub outcome_queue_capacity: usize,
    pub retry: RetryPolicy,
    /// Cancellation fires automatically once a run has taken this long.
    pub run_deadline: Option<Duration>,
    pub metrics_interval: Duration,
}

impl PipelineConfig {
    /// Pool sizes with queue capacities of twice the consuming pool.
    pub fn new(transform_workers: usize, persist_workers: usize, retry: RetryPolicy) -> Self {
        Self {
            transform_workers,
            persist_workers,
            transform_queue_capacity: transform_workers * 2,
            persist_queue_capacity: persist_workers * 2,
            outcome_queue_capacity: persist_workers * 2,
            retry,
            run_deadline: None,
            metrics_interval: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.transform_workers == 0 || self.persist_workers == 0 {
            return Err(Error::Config("worker pools need at least one worker".to_string()));
        }
        if self.transform_queue_capacity == 0
            || self.persist_queue_capacity == 0
            || self.outcome_queue_capacity == 0
        {
            return Err(Error::Config("queue capacities must be non-zero".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry max_attempts must be at least 1".to_string()));
        }
        if self.metrics_interval.is_zero() {
            return Err(Error::Config("metrics interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// How a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Input queue closed and empty.
    Drained,
    /// Cancellation observed at a suspension point.
    Cancelled,
}

/// Split a queue result into "carry on", "stop: cancelled", or a protocol
/// error that must reach the coordinator.
pub(crate) fn cancelled_or(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(Error::Cancelled) => Ok(false),
        Err(e) => Err(e),
    }
}
