//! Process-wide pipeline counters.
//!
//! Every counter is a monotonic `AtomicU64`. Queue counters
//! (`enqueued`/`dequeued`) are bumped by [`BoundedQueue`] while it holds its
//! lock, so `enqueued >= dequeued` holds at every instant. Outcome counters
//! (`ok`/`fail`) are bumped by the stage workers.
//!
//! [`BoundedQueue`]: crate::queue::BoundedQueue

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one stage.
#[derive(Debug, Default)]
pub struct StageCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    ok: AtomicU64,
    fail: AtomicU64,
}

impl StageCounters {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Release);
    }

    pub fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Release);
    }

    pub fn record_ok(&self) {
        self.ok.fetch_add(1, Ordering::Release);
    }

    pub fn record_fail(&self) {
        self.fail.fetch_add(1, Ordering::Release);
    }

    pub fn snapshot(&self) -> StageSnapshot {
        // Load in reverse pipeline order so a racing increment can only make
        // the earlier counters larger, never the later ones.
        let fail = self.fail.load(Ordering::Acquire);
        let ok = self.ok.load(Ordering::Acquire);
        let dequeued = self.dequeued.load(Ordering::Acquire);
        let enqueued = self.enqueued.load(Ordering::Acquire);
        StageSnapshot {
            enqueued,
            dequeued,
            ok,
            fail,
        }
    }
}

/// Counters shared by every component of one pipeline run.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub transform: Arc<StageCounters>,
    pub persist: Arc<StageCounters>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            taken_at: Utc::now(),
            transform: self.transform.snapshot(),
            persist: self.persist.snapshot(),
        }
    }
}

/// Point-in-time copy of one stage's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    pub enqueued: u64,
    pub dequeued: u64,
    pub ok: u64,
    pub fail: u64,
}

impl StageSnapshot {
    /// Items dequeued but not yet resolved (in flight, or dropped by
    /// cancellation).
    pub fn in_flight(&self) -> u64 {
        self.dequeued.saturating_sub(self.ok + self.fail)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub transform: StageSnapshot,
    pub persist: StageSnapshot,
}
