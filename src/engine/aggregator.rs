//! Results aggregator: one user-visible event per outcome.
//!
//! The aggregator ignores run cancellation. It drains the outcome queue until
//! the coordinator closes it, so every outcome a worker managed to publish
//! is reported.

use super::OutcomeQueue;
use crate::model::{Outcome, Stage};
use crate::telemetry::metrics;
use crate::telemetry::pipeline::{ComponentKind, start_component_span};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Everything the aggregator saw.
#[derive(Debug, Default)]
pub struct Aggregate {
    pub outcomes: Vec<Outcome>,
    pub succeeded: u64,
    pub failed: u64,
}

pub struct Aggregator {
    pub outcomes: Arc<OutcomeQueue>,
}

impl Aggregator {
    pub async fn run(self) -> Aggregate {
        let span = start_component_span(ComponentKind::Aggregator, 0);
        self.collect().instrument(span).await
    }

    async fn collect(self) -> Aggregate {
        let outcomes_counter = metrics::outcomes();
        let attempts_histogram = metrics::persist_attempts();
        let never = CancellationToken::new();
        let mut aggregate = Aggregate::default();

        loop {
            let outcome = match self.outcomes.get(&never).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => break,
                Err(e) => {
                    error!(tag = "outcome_stream", error = %e, "outcome stream failed");
                    break;
                }
            };

            match &outcome.error {
                None => {
                    aggregate.succeeded += 1;
                    info!(
                        tag = "success",
                        item = %outcome.item.id,
                        attempts = outcome.attempts,
                        "item completed"
                    );
                    outcomes_counter.add(
                        1,
                        &[
                            KeyValue::new("stage", Stage::Persist.to_string()),
                            KeyValue::new("result", "ok"),
                        ],
                    );
                }
                Some(err) => {
                    aggregate.failed += 1;
                    warn!(
                        tag = "failure",
                        item = %outcome.item.id,
                        stage = %err.stage(),
                        attempts = outcome.attempts,
                        error = %err,
                        "item failed"
                    );
                    outcomes_counter.add(
                        1,
                        &[
                            KeyValue::new("stage", err.stage().to_string()),
                            KeyValue::new("result", "fail"),
                        ],
                    );
                }
            }
            if outcome.attempts > 0 {
                attempts_histogram.record(u64::from(outcome.attempts), &[]);
            }
            aggregate.outcomes.push(outcome);
        }

        debug!(
            tag = "drained",
            succeeded = aggregate.succeeded,
            failed = aggregate.failed,
            "outcome stream ended"
        );
        aggregate
    }
}
