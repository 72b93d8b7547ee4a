//! Metrics reporter: periodic counter snapshots as structured log events.

use super::ItemQueue;
use crate::counters::{Counters, Snapshot};
use crate::telemetry::pipeline::{ComponentKind, start_component_span};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info};

/// Occupancy of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueGauge {
    pub len: usize,
    pub peak: usize,
    pub capacity: usize,
}

impl QueueGauge {
    pub fn of(queue: &ItemQueue) -> Self {
        Self {
            len: queue.len(),
            peak: queue.peak(),
            capacity: queue.capacity(),
        }
    }
}

/// Counters plus queue occupancy at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Snapshot,
    pub transform_queue: QueueGauge,
    pub persist_queue: QueueGauge,
}

impl MetricsSnapshot {
    pub fn capture(counters: &Counters, transform_queue: &ItemQueue, persist_queue: &ItemQueue) -> Self {
        Self {
            counters: counters.snapshot(),
            transform_queue: QueueGauge::of(transform_queue),
            persist_queue: QueueGauge::of(persist_queue),
        }
    }

    /// Emit this snapshot as one structured event.
    pub fn emit(&self) {
        let t = &self.counters.transform;
        let p = &self.counters.persist;
        info!(
            tag = "metrics",
            transform_enqueued = t.enqueued,
            transform_dequeued = t.dequeued,
            transform_ok = t.ok,
            transform_fail = t.fail,
            persist_enqueued = p.enqueued,
            persist_dequeued = p.dequeued,
            persist_ok = p.ok,
            persist_fail = p.fail,
            transform_queue_len = self.transform_queue.len,
            persist_queue_len = self.persist_queue.len,
            "metrics snapshot"
        );
    }
}

/// What the reporter did before it stopped.
#[derive(Debug, Clone, Default)]
pub struct ReporterSummary {
    pub emitted: u64,
    pub last: Option<MetricsSnapshot>,
}

pub struct MetricsReporter {
    pub counters: Counters,
    pub transform_queue: Arc<ItemQueue>,
    pub persist_queue: Arc<ItemQueue>,
    pub interval: Duration,
    /// Set by the coordinator during shutdown.
    pub stop: CancellationToken,
    pub cancel: CancellationToken,
}

impl MetricsReporter {
    pub async fn run(self) -> ReporterSummary {
        let span = start_component_span(ComponentKind::Reporter, 0);
        self.report().instrument(span).await
    }

    async fn report(self) -> ReporterSummary {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut summary = ReporterSummary::default();

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = MetricsSnapshot::capture(
                        &self.counters,
                        &self.transform_queue,
                        &self.persist_queue,
                    );
                    snapshot.emit();
                    summary.emitted += 1;
                    summary.last = Some(snapshot);
                }
            }
        }

        debug!(tag = "stopped", emitted = summary.emitted, "metrics reporter stopped");
        summary
    }
}
