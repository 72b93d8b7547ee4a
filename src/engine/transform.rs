//! Transform worker: one item at a time from the transform queue.
//!
//! Successes move on to the persist queue (this put is where backpressure
//! from the persist stage reaches us). Failures become an outcome right
//! away; transforms are never retried.

use super::{ItemQueue, OutcomeQueue, WorkerExit, cancelled_or};
use crate::capability::Transform;
use crate::counters::StageCounters;
use crate::error::{Error, Result};
use crate::model::{ItemState, Outcome};
use crate::telemetry::pipeline::{ComponentKind, record_state_transition, start_component_span};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, warn};

pub struct TransformWorker {
    pub id: usize,
    pub input: Arc<ItemQueue>,
    pub output: Arc<ItemQueue>,
    pub outcomes: Arc<OutcomeQueue>,
    pub transform: Arc<dyn Transform>,
    pub counters: Arc<StageCounters>,
    pub cancel: CancellationToken,
    /// Fires only if the aggregator is gone, so outcome publishing cannot
    /// block forever.
    pub outcome_cancel: CancellationToken,
}

impl TransformWorker {
    pub async fn run(self) -> Result<WorkerExit> {
        let span = start_component_span(ComponentKind::TransformWorker, self.id);
        self.work(span.clone()).instrument(span).await
    }

    async fn work(self, span: Span) -> Result<WorkerExit> {
        debug!(tag = "start", "transform worker started");
        loop {
            let item = match self.input.get(&self.cancel).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    debug!(tag = "drained", "transform queue drained, exiting");
                    return Ok(WorkerExit::Drained);
                }
                Err(Error::Cancelled) => {
                    debug!(tag = "cancelled", "cancelled while waiting for work");
                    return Ok(WorkerExit::Cancelled);
                }
                Err(e) => return Err(e),
            };
            record_state_transition(
                &span,
                &item.id,
                ItemState::TransformQueued,
                ItemState::TransformRunning,
            );

            let result = self.transform.transform(&item, &self.cancel).await;
            if self.cancel.is_cancelled() {
                record_state_transition(
                    &span,
                    &item.id,
                    ItemState::TransformRunning,
                    ItemState::Dropped,
                );
                debug!(tag = "dropped", item = %item.id, "cancelled during transform");
                return Ok(WorkerExit::Cancelled);
            }

            match result {
                Ok(()) => {
                    self.counters.record_ok();
                    let forwarded = self.output.put(Arc::clone(&item), &self.cancel).await;
                    if !cancelled_or(forwarded)? {
                        record_state_transition(
                            &span,
                            &item.id,
                            ItemState::TransformRunning,
                            ItemState::Dropped,
                        );
                        debug!(tag = "dropped", item = %item.id, "cancelled while forwarding");
                        return Ok(WorkerExit::Cancelled);
                    }
                    record_state_transition(
                        &span,
                        &item.id,
                        ItemState::TransformRunning,
                        ItemState::PersistQueued,
                    );
                }
                Err(err) => {
                    self.counters.record_fail();
                    warn!(
                        tag = "transform_failed",
                        item = %item.id,
                        error = %format!("{err:#}"),
                        "transform failed"
                    );
                    let outcome = Outcome::transform_failed(Arc::clone(&item), &err);
                    let published = self.outcomes.put(outcome, &self.outcome_cancel).await;
                    if !cancelled_or(published)? {
                        return Ok(WorkerExit::Cancelled);
                    }
                    record_state_transition(
                        &span,
                        &item.id,
                        ItemState::TransformRunning,
                        ItemState::TransformFailed,
                    );
                }
            }
        }
    }
}
