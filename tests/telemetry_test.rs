//! Integration tests for telemetry initialization and span helpers.

use stagepipe::capability::sim::{SimulatedPersist, SimulatedTransform};
use stagepipe::engine::{Pipeline, PipelineConfig};
use stagepipe::model::{ItemState, WorkItem};
use stagepipe::retry::RetryPolicy;
use stagepipe::telemetry::pipeline::{
    ComponentKind, record_state_transition, start_component_span, start_run_span,
};
use stagepipe::telemetry::{TelemetryConfig, init_telemetry, metrics};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::span::{Attributes, Id};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use uuid::Uuid;

/// Records the parent span name of every component span.
#[derive(Clone, Default)]
struct ComponentParents(Arc<Mutex<Vec<Option<String>>>>);

impl<S> Layer<S> for ComponentParents
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != "component" {
            return;
        }
        let parent = ctx
            .span(id)
            .and_then(|span| span.parent())
            .map(|parent| parent.name().to_string());
        self.0.lock().unwrap().push(parent);
    }
}

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so this may
    // return Err if another test got there first; that is acceptable.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "stagepipe-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = init_telemetry(config);
}

#[test]
fn telemetry_config_comes_from_pipeline_config() {
    let mut config = stagepipe::config::Config::with_workers(1, 2);
    config.otel_endpoint = Some("http://localhost:4317".to_string());
    config.log_level = "warn".to_string();

    let telemetry = TelemetryConfig::from_config(&config, "svc");
    assert_eq!(telemetry.endpoint.as_deref(), Some("http://localhost:4317"));
    assert_eq!(telemetry.service_name, "svc");
    assert_eq!(telemetry.log_level, "warn");
}

#[test]
fn component_span_records_transition() {
    let span = start_component_span(ComponentKind::TransformWorker, 3);
    record_state_transition(
        &span,
        "item-1",
        ItemState::TransformQueued,
        ItemState::TransformRunning,
    );
    assert_eq!(ComponentKind::PersistWorker.to_string(), "persist_worker");
}

#[test]
fn run_span_and_instruments_are_usable_without_exporter() {
    let span = start_run_span(&Uuid::new_v4());
    span.record("run.submitted", 3u64);

    metrics::outcomes().add(1, &[]);
    metrics::persist_attempts().record(2, &[]);
    metrics::items_dropped().add(1, &[]);
    metrics::run_duration_ms().record(12.5, &[]);
}

#[tokio::test]
async fn component_spans_nest_under_the_run_span() {
    let parents = ComponentParents::default();
    let subscriber = tracing_subscriber::registry().with(parents.clone());
    let _default = tracing::subscriber::set_default(subscriber);

    let retry = RetryPolicy::new(1, Duration::ZERO, Duration::ZERO);
    let pipeline = Pipeline::new(
        PipelineConfig::new(2, 2, retry),
        Arc::new(SimulatedTransform::new(Duration::ZERO)),
        Arc::new(SimulatedPersist::new(Duration::ZERO, 0.0)),
    )
    .unwrap();
    let report = pipeline
        .run(WorkItem::from_ids(["a", "b", "c"]))
        .await
        .unwrap();
    assert_eq!(report.succeeded, 3);

    let parents = parents.0.lock().unwrap().clone();
    // producer, two workers per pool, aggregator, reporter
    assert_eq!(parents.len(), 7, "{parents:?}");
    assert!(
        parents.iter().all(|p| p.as_deref() == Some("pipeline.run")),
        "{parents:?}"
    );
}
