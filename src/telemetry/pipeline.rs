//! Component span helpers.
//!
//! Each log event carries `component.kind` and `component.id` from the span
//! it runs in, a `tag` field, and its message. The subscriber adds the
//! timestamp.

use crate::model::ItemState;
use tracing::Span;
use uuid::Uuid;

/// Kinds of pipeline components that emit log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Producer,
    TransformWorker,
    PersistWorker,
    Aggregator,
    Reporter,
    Coordinator,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Producer => "producer",
            ComponentKind::TransformWorker => "transform_worker",
            ComponentKind::PersistWorker => "persist_worker",
            ComponentKind::Aggregator => "aggregator",
            ComponentKind::Reporter => "reporter",
            ComponentKind::Coordinator => "coordinator",
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Span wrapping a whole pipeline run.
pub fn start_run_span(run_id: &Uuid) -> Span {
    tracing::info_span!(
        "pipeline.run",
        "run.id" = %run_id,
        "run.submitted" = tracing::field::Empty,
    )
}

/// Span for one component instance. Worker ids are their index in the pool.
pub fn start_component_span(kind: ComponentKind, id: usize) -> Span {
    tracing::info_span!(
        "component",
        "component.kind" = kind.as_str(),
        "component.id" = id,
    )
}

/// Record an item state transition inside `span`.
pub fn record_state_transition(span: &Span, item_id: &str, from: ItemState, to: ItemState) {
    debug_assert!(
        from.can_transition_to(to),
        "illegal item transition {from} -> {to}"
    );
    span.in_scope(|| {
        tracing::debug!(
            tag = "state_transition",
            item = item_id,
            from = %from,
            to = %to,
            "state_transition"
        );
    });
}
