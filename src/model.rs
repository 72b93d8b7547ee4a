//! Core data model.
//!
//! A work item is an opaque unit of work. It flows through the transform
//! stage, then the persist stage, and ends in exactly one [`Outcome`]
//! unless cancellation drops it on the way.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work. Immutable once created by the producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Build shared items from a list of ids, the form the pipeline consumes.
    pub fn from_ids<I, S>(ids: I) -> Vec<Arc<WorkItem>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ids.into_iter().map(|id| Arc::new(Self::new(id))).collect()
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Pipeline stage that produced an outcome or emitted a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transform,
    Persist,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Transform => "transform",
            Stage::Persist => "persist",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why an item failed. Capability errors are flattened to their message so
/// outcomes stay cloneable and serializable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageError {
    #[error("transform failed: {message}")]
    Transform { message: String },

    #[error("persist failed after {attempts} attempt(s): {message}")]
    Persist { attempts: u32, message: String },
}

impl StageError {
    pub fn stage(&self) -> Stage {
        match self {
            StageError::Transform { .. } => Stage::Transform,
            StageError::Persist { .. } => Stage::Persist,
        }
    }
}

/// Terminal record for a work item. Created exactly once per item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub item: Arc<WorkItem>,
    pub error: Option<StageError>,
    /// Persist attempts made. Zero when the transform stage failed.
    pub attempts: u32,
}

impl Outcome {
    pub fn success(item: Arc<WorkItem>, attempts: u32) -> Self {
        Self {
            item,
            error: None,
            attempts,
        }
    }

    pub fn transform_failed(item: Arc<WorkItem>, error: &anyhow::Error) -> Self {
        Self {
            item,
            error: Some(StageError::Transform {
                message: format!("{error:#}"),
            }),
            attempts: 0,
        }
    }

    pub fn persist_failed(item: Arc<WorkItem>, attempts: u32, error: &anyhow::Error) -> Self {
        Self {
            item,
            error: Some(StageError::Persist {
                attempts,
                message: format!("{error:#}"),
            }),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// Item state
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item as it moves through the stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Submitted,
    TransformQueued,
    TransformRunning,
    /// Transform failed. Terminal.
    TransformFailed,
    PersistQueued,
    PersistRunning,
    /// Persisted successfully. Terminal.
    Persisted,
    /// Persist retries exhausted. Terminal.
    PersistExhausted,
    /// Cancelled before reaching an outcome. Terminal, no outcome emitted.
    Dropped,
}

impl ItemState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        if to == Dropped {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Submitted, TransformQueued)
                | (TransformQueued, TransformRunning)
                | (TransformRunning, TransformFailed)
                | (TransformRunning, PersistQueued)
                | (PersistQueued, PersistRunning)
                | (PersistRunning, Persisted)
                | (PersistRunning, PersistExhausted)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemState::TransformFailed
                | ItemState::Persisted
                | ItemState::PersistExhausted
                | ItemState::Dropped
        )
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Submitted => "submitted",
            ItemState::TransformQueued => "transform_queued",
            ItemState::TransformRunning => "transform_running",
            ItemState::TransformFailed => "transform_failed",
            ItemState::PersistQueued => "persist_queued",
            ItemState::PersistRunning => "persist_running",
            ItemState::Persisted => "persisted",
            ItemState::PersistExhausted => "persist_exhausted",
            ItemState::Dropped => "dropped",
        };
        write!(f, "{s}")
    }
}
