//! Persist worker: runs the persist capability through the retry policy and
//! publishes exactly one outcome per item it takes.

use super::{ItemQueue, OutcomeQueue, WorkerExit, cancelled_or};
use crate::capability::Persist;
use crate::counters::StageCounters;
use crate::error::{Error, Result};
use crate::model::{ItemState, Outcome};
use crate::retry::{RetryError, RetryPolicy};
use crate::telemetry::pipeline::{ComponentKind, record_state_transition, start_component_span};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

pub struct PersistWorker {
    pub id: usize,
    pub input: Arc<ItemQueue>,
    pub outcomes: Arc<OutcomeQueue>,
    pub persist: Arc<dyn Persist>,
    pub retry: RetryPolicy,
    pub counters: Arc<StageCounters>,
    pub cancel: CancellationToken,
    /// Fires only if the aggregator is gone.
    pub outcome_cancel: CancellationToken,
}

impl PersistWorker {
    pub async fn run(self) -> Result<WorkerExit> {
        let span = start_component_span(ComponentKind::PersistWorker, self.id);
        self.work(span.clone()).instrument(span).await
    }

    async fn work(self, span: Span) -> Result<WorkerExit> {
        debug!(tag = "start", "persist worker started");
        loop {
            let item = match self.input.get(&self.cancel).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    debug!(tag = "drained", "persist queue drained, exiting");
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
                ItemState::PersistQueued,
                ItemState::PersistRunning,
            );

            let persist = self.persist.as_ref();
            let target = item.as_ref();
            let cancel = &self.cancel;
            let result = self
                .retry
                .run(cancel, move |attempt| async move {
                    debug!(tag = "persist_attempt", item = %target.id, attempt, "persisting");
                    persist.persist(target, cancel).await
                })
                .await;

            let (outcome, next) = match result {
                Ok(((), attempts)) => {
                    self.counters.record_ok();
                    info!(tag = "persisted", item = %item.id, attempts, "item persisted");
                    (Outcome::success(Arc::clone(&item), attempts), ItemState::Persisted)
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    self.counters.record_fail();
                    warn!(
                        tag = "persist_exhausted",
                        item = %item.id,
                        attempts,
                        error = %format!("{last:#}"),
                        "persist retries exhausted"
                    );
                    (
                        Outcome::persist_failed(Arc::clone(&item), attempts, &last),
                        ItemState::PersistExhausted,
                    )
                }
                Err(RetryError::Cancelled { attempts, .. }) => {
                    record_state_transition(
                        &span,
                        &item.id,
                        ItemState::PersistRunning,
                        ItemState::Dropped,
                    );
                    debug!(tag = "dropped", item = %item.id, attempts, "cancelled during persist");
                    return Ok(WorkerExit::Cancelled);
                }
            };

            let published = self.outcomes.put(outcome, &self.outcome_cancel).await;
            if !cancelled_or(published)? {
                return Ok(WorkerExit::Cancelled);
            }
            record_state_transition(&span, &item.id, ItemState::PersistRunning, next);
        }
    }
}
