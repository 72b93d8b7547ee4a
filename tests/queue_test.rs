//! Integration tests for the bounded queue.

use stagepipe::counters::StageCounters;
use stagepipe::error::Error;
use stagepipe::queue::BoundedQueue;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn token() -> CancellationToken {
    CancellationToken::new()
}

// ---------------------------------------------------------------------------
// Basic FIFO behaviour
// ---------------------------------------------------------------------------

#[tokio::test]
async fn items_come_out_in_fifo_order() {
    let queue = BoundedQueue::new("test", 4);
    let cancel = token();

    for n in 1..=3 {
        queue.put(n, &cancel).await.unwrap();
    }
    assert_eq!(queue.len(), 3);

    assert_eq!(queue.get(&cancel).await.unwrap(), Some(1));
    assert_eq!(queue.get(&cancel).await.unwrap(), Some(2));
    assert_eq!(queue.get(&cancel).await.unwrap(), Some(3));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn counters_track_enqueue_and_dequeue() {
    let counters = Arc::new(StageCounters::default());
    let queue = BoundedQueue::with_counters("test", 2, Arc::clone(&counters));
    let cancel = token();

    queue.put("a", &cancel).await.unwrap();
    queue.put("b", &cancel).await.unwrap();
    queue.get(&cancel).await.unwrap();

    let snap = counters.snapshot();
    assert_eq!(snap.enqueued, 2);
    assert_eq!(snap.dequeued, 1);
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn put_blocks_while_full_until_a_get() {
    let queue = Arc::new(BoundedQueue::new("test", 2));
    let cancel = token();

    queue.put(1, &cancel).await.unwrap();
    queue.put(2, &cancel).await.unwrap();

    let blocked = {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.put(3, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished(), "third put should wait for a free slot");
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.get(&cancel).await.unwrap(), Some(1));
    blocked.await.unwrap().unwrap();

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.peak(), 2);
}

#[tokio::test(start_paused = true)]
async fn get_blocks_while_empty_until_a_put() {
    let queue = Arc::new(BoundedQueue::new("test", 1));
    let cancel = token();

    let waiting = {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.get(&cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    queue.put("x", &cancel).await.unwrap();
    assert_eq!(waiting.await.unwrap().unwrap(), Some("x"));
}

// ---------------------------------------------------------------------------
// Close protocol
// ---------------------------------------------------------------------------

#[tokio::test]
async fn closed_queue_drains_then_reports_end_of_stream() {
    let queue = BoundedQueue::new("test", 3);
    let cancel = token();

    queue.put(1, &cancel).await.unwrap();
    queue.put(2, &cancel).await.unwrap();
    queue.close_for_writes();
    queue.close_for_writes();

    assert!(queue.is_closed());
    assert_eq!(queue.get(&cancel).await.unwrap(), Some(1));
    assert_eq!(queue.get(&cancel).await.unwrap(), Some(2));
    assert_eq!(queue.get(&cancel).await.unwrap(), None);
    assert_eq!(queue.get(&cancel).await.unwrap(), None);
}

#[tokio::test]
async fn put_after_close_fails_fast() {
    let queue = BoundedQueue::new("transform", 3);
    queue.close_for_writes();

    let err = queue.put(1, &token()).await.unwrap_err();
    assert!(matches!(err, Error::QueueClosed { queue: "transform" }));
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_wakes_blocked_readers_and_writers() {
    let empty = Arc::new(BoundedQueue::<u32>::new("empty", 1));
    let full = Arc::new(BoundedQueue::new("full", 1));
    let cancel = token();
    full.put(0, &cancel).await.unwrap();

    let reader = {
        let queue = Arc::clone(&empty);
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.get(&cancel).await })
    };
    let writer = {
        let queue = Arc::clone(&full);
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.put(1, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!reader.is_finished());
    assert!(!writer.is_finished());

    empty.close_for_writes();
    full.close_for_writes();

    assert_eq!(reader.await.unwrap().unwrap(), None);
    assert!(matches!(
        writer.await.unwrap(),
        Err(Error::QueueClosed { queue: "full" })
    ));
    // The item queued before close is still delivered.
    assert_eq!(full.get(&cancel).await.unwrap(), Some(0));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_blocked_put_and_get() {
    let full = Arc::new(BoundedQueue::new("full", 1));
    let empty = Arc::new(BoundedQueue::<u32>::new("empty", 1));
    let cancel = token();
    full.put(0, &cancel).await.unwrap();

    let writer = {
        let queue = Arc::clone(&full);
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.put(1, &cancel).await })
    };
    let reader = {
        let queue = Arc::clone(&empty);
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.get(&cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    assert!(writer.await.unwrap().unwrap_err().is_cancelled());
    assert!(reader.await.unwrap().unwrap_err().is_cancelled());
    assert_eq!(full.len(), 1);
}

#[tokio::test]
async fn cancelled_token_stops_new_work_being_taken() {
    let queue = BoundedQueue::new("test", 2);
    queue.put(1, &token()).await.unwrap();

    let cancel = token();
    cancel.cancel();

    assert!(queue.get(&cancel).await.unwrap_err().is_cancelled());
    assert!(queue.put(2, &cancel).await.unwrap_err().is_cancelled());
    assert_eq!(queue.len(), 1);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_producers_and_consumers_see_each_item_once() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 50;
    const CAPACITY: usize = 3;

    let queue = Arc::new(BoundedQueue::new("mpmc", CAPACITY));
    let cancel = token();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for n in 0..PER_PRODUCER {
                    queue.put(p * 1000 + n, &cancel).await.unwrap();
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(n) = queue.get(&cancel).await.unwrap() {
                    seen.push(n);
                }
                seen
            })
        })
        .collect();

    for producer in producers {
        producer.await.unwrap();
    }
    queue.close_for_writes();

    let mut all = HashSet::new();
    let mut total = 0;
    for consumer in consumers {
        for n in consumer.await.unwrap() {
            total += 1;
            assert!(all.insert(n), "item {n} delivered twice");
        }
    }

    assert_eq!(total, PRODUCERS * PER_PRODUCER);
    assert!(queue.peak() <= CAPACITY);
}
