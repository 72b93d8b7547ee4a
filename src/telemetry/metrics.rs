//! Metric instrument factories for stagepipe.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"stagepipe"` meter; without an exporter
//! they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("stagepipe")
}

/// Counter: terminal outcomes reported by the aggregator.
/// Labels: `stage` ("transform" | "persist"), `result` ("ok" | "fail").
pub fn outcomes() -> Counter<u64> {
    meter()
        .u64_counter("stagepipe.outcomes")
        .with_description("Terminal outcomes per stage and result")
        .build()
}

/// Histogram: persist attempts used per item that reached the persist stage.
pub fn persist_attempts() -> Histogram<u64> {
    meter()
        .u64_histogram("stagepipe.persist.attempts")
        .with_description("Persist attempts per item")
        .build()
}

/// Counter: items submitted but dropped by cancellation before an outcome.
pub fn items_dropped() -> Counter<u64> {
    meter()
        .u64_counter("stagepipe.items.dropped")
        .with_description("Items dropped by cancellation")
        .build()
}

/// Histogram: wall-clock duration of a whole pipeline run in milliseconds.
pub fn run_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("stagepipe.run.duration_ms")
        .with_description("Pipeline run duration in milliseconds")
        .with_unit("ms")
        .build()
}
