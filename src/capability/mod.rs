//! External capabilities invoked by the stage workers.
//!
//! The pipeline does not know what "transform" or "persist" mean. Both are
//! supplied by the caller as trait objects and must be safe to call
//! concurrently on different items. Errors are opaque `anyhow::Error`s.

pub mod sim;

use crate::model::WorkItem;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Compute-bound first stage. Failures are not retried.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn transform(&self, item: &WorkItem, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// I/O-bound second stage. May be called more than once for the same item.
#[async_trait]
pub trait Persist: Send + Sync {
    async fn persist(&self, item: &WorkItem, cancel: &CancellationToken) -> anyhow::Result<()>;
}
