//! Fixed-capacity FIFO with blocking put/get and a drain-on-close protocol.
//!
//! `put` waits while the queue is full, `get` waits while it is empty and
//! still open. [`BoundedQueue::close_for_writes`] is the only way to say "no
//! more items": afterwards `put` fails fast and `get` keeps returning items
//! until the queue is empty, then reports end-of-stream with `Ok(None)`.
//!
//! Both waits observe a [`CancellationToken`]. A cancelled token is checked
//! before touching the queue, so a cancelled worker neither takes new work
//! nor forwards what it holds.

use crate::counters::StageCounters;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    peak: usize,
}

pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_full: Notify,
    not_empty: Notify,
    counters: Option<Arc<StageCounters>>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; a zero-capacity queue could never
    /// accept an item.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        assert!(capacity > 0, "queue {name} needs a non-zero capacity");
        Self {
            name,
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                peak: 0,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            counters: None,
        }
    }

    /// Create a queue that records enqueue/dequeue counts on `counters`.
    pub fn with_counters(name: &'static str, capacity: usize, counters: Arc<StageCounters>) -> Self {
        Self {
            counters: Some(counters),
            ..Self::new(name, capacity)
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest occupancy observed since construction.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append `item`, waiting for a free slot.
    ///
    /// Fails with [`Error::Cancelled`] if `cancel` fires first, and with
    /// [`Error::QueueClosed`] once the queue is closed for writes. Either
    /// way the item is dropped.
    pub async fn put(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // Register before checking so a slot freed in between is not missed.
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(Error::QueueClosed { queue: self.name });
                }
                if inner.items.len() < self.capacity {
                    inner.items.push_back(item);
                    inner.peak = inner.peak.max(inner.items.len());
                    if let Some(counters) = &self.counters {
                        counters.record_enqueued();
                    }
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Take the oldest item, waiting while the queue is empty and open.
    ///
    /// Returns `Ok(None)` once the queue is closed for writes and drained.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<Option<T>> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    if let Some(counters) = &self.counters {
                        counters.record_dequeued();
                    }
                    drop(inner);
                    self.not_full.notify_one();
                    return Ok(Some(item));
                }
                if inner.closed {
                    return Ok(None);
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Stop accepting writes. Idempotent and non-blocking.
    ///
    /// Every waiter is woken: blocked writers fail with
    /// [`Error::QueueClosed`], blocked readers drain what is left and then
    /// see end-of-stream.
    pub fn close_for_writes(&self) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // Nothing panics while the lock is held, so a poisoned lock still
        // guards consistent data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("BoundedQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &inner.items.len())
            .field("closed", &inner.closed)
            .finish()
    }
}
