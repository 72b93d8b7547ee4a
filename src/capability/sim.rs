//! Simulated capabilities for the CLI and for exercising the pipeline.
//!
//! They stand in for the real image transform and storage write: each one
//! sleeps for a configured latency (cut short by cancellation) and then
//! succeeds or fails according to a simple rule.

use super::{Persist, Transform};
use crate::model::WorkItem;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn simulate_latency(latency: Duration, cancel: &CancellationToken) -> anyhow::Result<()> {
    if latency.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("interrupted by cancellation")),
        _ = tokio::time::sleep(latency) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// Transform that fails deterministically for a fixed set of item ids.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransform {
    latency: Duration,
    fail_ids: HashSet<String>,
}

impl SimulatedTransform {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail_ids: HashSet::new(),
        }
    }

    /// Make the transform fail for `id`.
    pub fn fail_on(mut self, id: impl Into<String>) -> Self {
        self.fail_ids.insert(id.into());
        self
    }
}

#[async_trait]
impl Transform for SimulatedTransform {
    async fn transform(&self, item: &WorkItem, cancel: &CancellationToken) -> anyhow::Result<()> {
        simulate_latency(self.latency, cancel).await?;
        if self.fail_ids.contains(&item.id) {
            bail!("cannot decode {}", item.id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persist
// ---------------------------------------------------------------------------

/// Persist that fails each attempt independently with `failure_rate`.
#[derive(Debug, Clone)]
pub struct SimulatedPersist {
    latency: Duration,
    failure_rate: f64,
}

impl SimulatedPersist {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl Persist for SimulatedPersist {
    async fn persist(&self, item: &WorkItem, cancel: &CancellationToken) -> anyhow::Result<()> {
        simulate_latency(self.latency, cancel).await?;
        if self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate) {
            bail!("storage write for {} timed out", item.id);
        }
        Ok(())
    }
}

/// Persist that fails the first `failures` attempts for every item, then
/// succeeds. Records how often each item was attempted.
#[derive(Debug, Default)]
pub struct ScriptedPersist {
    failures: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedPersist {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Number of persist calls seen for `id`.
    pub fn attempts_for(&self, id: &str) -> u32 {
        self.attempts
            .lock()
            .map(|attempts| attempts.get(id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total persist calls across all items.
    pub fn total_attempts(&self) -> u32 {
        self.attempts
            .lock()
            .map(|attempts| attempts.values().sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Persist for ScriptedPersist {
    async fn persist(&self, item: &WorkItem, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let attempt = {
            let mut attempts = self
                .attempts
                .lock()
                .map_err(|_| anyhow!("attempt ledger poisoned"))?;
            let count = attempts.entry(item.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if attempt <= self.failures {
            bail!("attempt {attempt} for {} rejected", item.id);
        }
        Ok(())
    }
}
