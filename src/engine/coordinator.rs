//! Shutdown coordinator: starts every component of a run and closes the
//! queues in a fixed order.
//!
//! 1. The producer enqueues every item, then closes the transform queue.
//! 2. Wait for all transform workers to exit.
//! 3. Close the persist queue.
//! 4. Wait for all persist workers to exit.
//! 5. Close the outcome queue.
//! 6. Stop the metrics reporter.
//! 7. Wait for the aggregator to reach end-of-stream.
//!
//! Cancellation (external, deadline, or a failed worker) only makes the
//! workers finish sooner. The steps above always run, in this order.

use super::aggregator::{Aggregate, Aggregator};
use super::persist::PersistWorker;
use super::reporter::{MetricsReporter, MetricsSnapshot, ReporterSummary};
use super::transform::TransformWorker;
use super::{ItemQueue, OutcomeQueue, PipelineConfig, WorkerExit};
use crate::capability::{Persist, Transform};
use crate::counters::Counters;
use crate::error::{Error, Result};
use crate::model::{ItemState, Outcome, WorkItem};
use crate::queue::BoundedQueue;
use crate::telemetry::metrics;
use crate::telemetry::pipeline::{
    ComponentKind, record_state_transition, start_component_span, start_run_span,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Items handed to the run.
    pub submitted: u64,
    /// Items the producer got into the transform queue.
    pub enqueued: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Whether cancellation fired during the run.
    pub cancelled: bool,
    pub outcomes: Vec<Outcome>,
    pub snapshot: MetricsSnapshot,
    pub snapshots_emitted: u64,
}

impl RunReport {
    /// Submitted items that never produced an outcome.
    pub fn dropped(&self) -> u64 {
        self.submitted.saturating_sub(self.outcomes.len() as u64)
    }

    pub fn outcome_for(&self, id: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.item.id == id)
    }
}

/// A configured pipeline. Each call to [`Pipeline::spawn`] or
/// [`Pipeline::run`] is an independent run with fresh queues and counters.
pub struct Pipeline {
    config: PipelineConfig,
    transform: Arc<dyn Transform>,
    persist: Arc<dyn Persist>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        transform: Arc<dyn Transform>,
        persist: Arc<dyn Persist>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transform,
            persist,
            cancel: CancellationToken::new(),
        })
    }

    /// Derive run cancellation from `parent` (e.g. a Ctrl-C token).
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Token that cancels every run of this pipeline.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `items` through the pipeline and wait for full shutdown.
    pub async fn run(&self, items: Vec<Arc<WorkItem>>) -> Result<RunReport> {
        self.spawn(items).join().await
    }

    /// Start a run in the background.
    pub fn spawn(&self, items: Vec<Arc<WorkItem>>) -> RunHandle {
        let run_id = Uuid::new_v4();
        let cancel = self.cancel.child_token();
        let counters = Counters::new();
        let stages = Stages {
            transform_queue: Arc::new(BoundedQueue::with_counters(
                "transform",
                self.config.transform_queue_capacity,
                Arc::clone(&counters.transform),
            )),
            persist_queue: Arc::new(BoundedQueue::with_counters(
                "persist",
                self.config.persist_queue_capacity,
                Arc::clone(&counters.persist),
            )),
            outcomes: Arc::new(BoundedQueue::new(
                "outcomes",
                self.config.outcome_queue_capacity,
            )),
            counters: counters.clone(),
        };

        let coordinator = Coordinator {
            run_id,
            config: self.config.clone(),
            transform: Arc::clone(&self.transform),
            persist: Arc::clone(&self.persist),
            stages: stages.clone(),
            cancel: cancel.clone(),
        };
        let span = start_run_span(&run_id);
        span.record("run.submitted", items.len() as u64);
        let task = tokio::spawn(coordinator.run(items).instrument(span));

        RunHandle {
            run_id,
            cancel,
            stages,
            task,
        }
    }
}

/// Handle to a run started with [`Pipeline::spawn`].
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    stages: Stages,
    task: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Fire cancellation for this run only.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn counters(&self) -> &Counters {
        &self.stages.counters
    }

    pub fn transform_queue(&self) -> &Arc<ItemQueue> {
        &self.stages.transform_queue
    }

    pub fn persist_queue(&self) -> &Arc<ItemQueue> {
        &self.stages.persist_queue
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.stages.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to shut down completely.
    pub async fn join(self) -> Result<RunReport> {
        self.task.await?
    }
}

#[derive(Clone)]
struct Stages {
    transform_queue: Arc<ItemQueue>,
    persist_queue: Arc<ItemQueue>,
    outcomes: Arc<OutcomeQueue>,
    counters: Counters,
}

impl Stages {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::capture(&self.counters, &self.transform_queue, &self.persist_queue)
    }
}

struct Coordinator {
    run_id: Uuid,
    config: PipelineConfig,
    transform: Arc<dyn Transform>,
    persist: Arc<dyn Persist>,
    stages: Stages,
    cancel: CancellationToken,
}

impl Coordinator {
    async fn run(self, items: Vec<Arc<WorkItem>>) -> Result<RunReport> {
        let started_at = Utc::now();
        let started = Instant::now();
        let submitted = items.len() as u64;
        let stages = &self.stages;

        info!(
            tag = "start",
            run_id = %self.run_id,
            submitted,
            transform_workers = self.config.transform_workers,
            persist_workers = self.config.persist_workers,
            "pipeline starting"
        );

        let deadline = self.config.run_deadline.map(|limit| {
            let cancel = self.cancel.clone();
            let watchdog = async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!(
                            tag = "deadline",
                            limit_ms = limit.as_millis() as u64,
                            "run deadline reached, cancelling"
                        );
                        cancel.cancel();
                    }
                }
            };
            tokio::spawn(watchdog.in_current_span())
        });

        // Outcome publishing only gives up once the aggregator is gone.
        let outcome_cancel = CancellationToken::new();
        let aggregator = {
            let aggregator = Aggregator {
                outcomes: Arc::clone(&stages.outcomes),
            };
            let gone = outcome_cancel.clone().drop_guard();
            tokio::spawn(
                async move {
                    let _gone = gone;
                    aggregator.run().await
                }
                .in_current_span(),
            )
        };

        let reporter_stop = CancellationToken::new();
        let reporter = tokio::spawn(
            MetricsReporter {
                counters: stages.counters.clone(),
                transform_queue: Arc::clone(&stages.transform_queue),
                persist_queue: Arc::clone(&stages.persist_queue),
                interval: self.config.metrics_interval,
                stop: reporter_stop.clone(),
                cancel: self.cancel.clone(),
            }
            .run()
            .in_current_span(),
        );

        let transform_pool: Vec<_> = (0..self.config.transform_workers)
            .map(|id| {
                let worker = TransformWorker {
                    id,
                    input: Arc::clone(&stages.transform_queue),
                    output: Arc::clone(&stages.persist_queue),
                    outcomes: Arc::clone(&stages.outcomes),
                    transform: Arc::clone(&self.transform),
                    counters: Arc::clone(&stages.counters.transform),
                    cancel: self.cancel.clone(),
                    outcome_cancel: outcome_cancel.clone(),
                };
                spawn_guarded(&self.cancel, worker.run())
            })
            .collect();

        let persist_pool: Vec<_> = (0..self.config.persist_workers)
            .map(|id| {
                let worker = PersistWorker {
                    id,
                    input: Arc::clone(&stages.persist_queue),
                    outcomes: Arc::clone(&stages.outcomes),
                    persist: Arc::clone(&self.persist),
                    retry: self.config.retry,
                    counters: Arc::clone(&stages.counters.persist),
                    cancel: self.cancel.clone(),
                    outcome_cancel: outcome_cancel.clone(),
                };
                spawn_guarded(&self.cancel, worker.run())
            })
            .collect();

        let mut fatal: Option<Error> = None;

        // 1. Produce, then close the transform queue.
        let enqueued = match produce(&stages.transform_queue, items, &self.cancel).await {
            Ok(n) => n,
            Err(e) => {
                error!(tag = "producer", error = %e, "producer failed");
                self.cancel.cancel();
                fatal.get_or_insert(e);
                stages.counters.transform.snapshot().enqueued
            }
        };

        // 2-3.
        join_pool(ComponentKind::TransformWorker, transform_pool, &mut fatal).await;
        stages.persist_queue.close_for_writes();
        debug!(tag = "shutdown", "persist queue closed");

        // 4-5.
        join_pool(ComponentKind::PersistWorker, persist_pool, &mut fatal).await;
        stages.outcomes.close_for_writes();
        debug!(tag = "shutdown", "outcome queue closed");

        // 6.
        reporter_stop.cancel();
        let reporter_summary = match reporter.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(tag = "shutdown", error = %e, "metrics reporter failed");
                fatal.get_or_insert(Error::Join(e));
                ReporterSummary::default()
            }
        };

        // 7.
        let aggregate = match aggregator.await {
            Ok(aggregate) => aggregate,
            Err(e) => {
                error!(tag = "shutdown", error = %e, "aggregator failed");
                fatal.get_or_insert(Error::Join(e));
                Aggregate::default()
            }
        };

        if let Some(handle) = deadline {
            handle.abort();
        }

        let cancelled = self.cancel.is_cancelled();
        let snapshot = stages.snapshot();
        let report = RunReport {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            submitted,
            enqueued,
            succeeded: aggregate.succeeded,
            failed: aggregate.failed,
            cancelled,
            outcomes: aggregate.outcomes,
            snapshot,
            snapshots_emitted: reporter_summary.emitted,
        };

        let dropped = report.dropped();
        if dropped > 0 {
            metrics::items_dropped().add(dropped, &[]);
        }
        metrics::run_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        info!(
            tag = "summary",
            submitted = report.submitted,
            succeeded = report.succeeded,
            failed = report.failed,
            dropped,
            cancelled,
            duration_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Feed `items` into the transform queue, then close it for writes.
///
/// Returns how many items were enqueued. Cancellation stops production
/// early and is not an error.
async fn produce(
    queue: &ItemQueue,
    items: Vec<Arc<WorkItem>>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let span = start_component_span(ComponentKind::Producer, 0);
    let total = items.len();
    let result = async {
        let mut enqueued = 0u64;
        for item in items {
            let id = item.id.clone();
            match queue.put(item, cancel).await {
                Ok(()) => {
                    enqueued += 1;
                    record_state_transition(
                        &tracing::Span::current(),
                        &id,
                        ItemState::Submitted,
                        ItemState::TransformQueued,
                    );
                }
                Err(Error::Cancelled) => {
                    info!(
                        tag = "cancelled",
                        enqueued,
                        remaining = total as u64 - enqueued,
                        "producer stopped by cancellation"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(enqueued)
    }
    .instrument(span)
    .await;

    queue.close_for_writes();
    debug!(tag = "shutdown", "transform queue closed");
    result
}

/// Spawn a worker whose failure (error or panic) cancels the whole run, so
/// no sibling is left waiting on a queue nobody serves.
fn spawn_guarded<F>(cancel: &CancellationToken, worker: F) -> JoinHandle<Result<WorkerExit>>
where
    F: std::future::Future<Output = Result<WorkerExit>> + Send + 'static,
{
    let guard = cancel.clone().drop_guard();
    tokio::spawn(
        async move {
            let result = worker.await;
            if result.is_ok() {
                let _ = guard.disarm();
            }
            result
        }
        .in_current_span(),
    )
}

/// Wait for every worker of a pool. Errors are logged, and the first one is
/// kept for the caller; they never stop the wait for the remaining workers.
async fn join_pool(
    kind: ComponentKind,
    pool: Vec<JoinHandle<Result<WorkerExit>>>,
    fatal: &mut Option<Error>,
) {
    let mut drained = 0usize;
    let mut cancelled = 0usize;
    for handle in pool {
        match handle.await {
            Ok(Ok(WorkerExit::Drained)) => drained += 1,
            Ok(Ok(WorkerExit::Cancelled)) => cancelled += 1,
            Ok(Err(e)) => {
                error!(tag = "shutdown", pool = %kind, error = %e, "worker failed");
                fatal.get_or_insert(e);
            }
            Err(e) => {
                error!(tag = "shutdown", pool = %kind, error = %e, "worker panicked");
                fatal.get_or_insert(Error::Join(e));
            }
        }
    }
    debug!(tag = "shutdown", pool = %kind, drained, cancelled, "pool exited");
}
