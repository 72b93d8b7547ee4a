//! Integration tests for the retry policy.

use stagepipe::retry::{RetryError, RetryPolicy};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Action that fails until attempt `succeed_on`, counting calls.
async fn flaky(calls: &AtomicU32, attempt: u32, succeed_on: u32) -> Result<u32, String> {
    calls.fetch_add(1, Ordering::SeqCst);
    if attempt >= succeed_on {
        Ok(attempt)
    } else {
        Err(format!("fail {attempt}"))
    }
}

// ---------------------------------------------------------------------------
// Attempt accounting
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn first_success_returns_without_sleeping() {
    let policy = RetryPolicy::new(3, ms(100), ms(0));
    let calls = AtomicU32::new(0);
    let start = Instant::now();

    let (value, attempts) = policy
        .run(&CancellationToken::new(), |attempt| flaky(&calls, attempt, 1))
        .await
        .unwrap();

    assert_eq!((value, attempts), (1, 1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn succeeds_on_third_attempt_within_limit() {
    let policy = RetryPolicy::new(3, ms(10), ms(5));
    let calls = AtomicU32::new(0);

    let (_, attempts) = policy
        .run(&CancellationToken::new(), |attempt| flaky(&calls, attempt, 3))
        .await
        .unwrap();

    assert_eq!(attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_return_last_error() {
    let policy = RetryPolicy::new(3, ms(10), ms(0));
    let calls = AtomicU32::new(0);

    let err = policy
        .run(&CancellationToken::new(), |attempt| flaky(&calls, attempt, 4))
        .await
        .unwrap_err();

    match err {
        RetryError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert_eq!(last, "fail 3");
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn single_attempt_policy_never_retries() {
    let policy = RetryPolicy::new(1, ms(10), ms(0));
    let calls = AtomicU32::new(0);

    let err = policy
        .run(&CancellationToken::new(), |attempt| flaky(&calls, attempt, 2))
        .await
        .unwrap_err();

    assert_eq!(err.attempts(), 1);
    assert!(!err.is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Backoff timing
// ---------------------------------------------------------------------------

#[test]
fn backoff_doubles_from_base_delay() {
    let policy = RetryPolicy::new(5, ms(100), ms(0));
    assert_eq!(policy.backoff(1), ms(100));
    assert_eq!(policy.backoff(2), ms(200));
    assert_eq!(policy.backoff(3), ms(400));
    assert_eq!(policy.backoff(4), ms(800));
    assert_eq!(policy.delay_with_jitter(3), ms(400));
}

#[test]
fn backoff_saturates_instead_of_overflowing() {
    let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(u64::MAX / 2), ms(0));
    assert_eq!(policy.backoff(200), Duration::MAX);
}

#[test]
fn jitter_stays_within_bounds() {
    let policy = RetryPolicy::new(3, ms(100), ms(25));
    for _ in 0..200 {
        let delay = policy.delay_with_jitter(2);
        assert!(delay >= ms(200));
        assert!(delay <= ms(225));
    }
}

#[tokio::test(start_paused = true)]
async fn delays_grow_exponentially_and_never_shrink() {
    let base = ms(100);
    let jitter = ms(30);
    let policy = RetryPolicy::new(5, base, jitter);
    let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));

    let result: Result<((), u32), RetryError<String>> = policy
        .run(&CancellationToken::new(), |attempt| {
            let stamps = Arc::clone(&stamps);
            async move {
                stamps.lock().unwrap().push(Instant::now());
                Err(format!("fail {attempt}"))
            }
        })
        .await;
    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 5, .. })));

    let stamps = stamps.lock().unwrap();
    assert_eq!(stamps.len(), 5);
    let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();

    for (i, gap) in gaps.iter().enumerate() {
        let floor = policy.backoff(i as u32 + 1);
        assert!(*gap >= floor, "gap {i} = {gap:?} below {floor:?}");
        // Timer resolution can round a deadline up by one millisecond.
        assert!(*gap <= floor + jitter + ms(1), "gap {i} = {gap:?} too large");
    }
    for pair in gaps.windows(2) {
        assert!(pair[1] >= pair[0], "delays shrank: {gaps:?}");
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff_sleep() {
    let policy = RetryPolicy::new(3, Duration::from_secs(10), ms(0));
    let cancel = CancellationToken::new();
    let calls = AtomicU32::new(0);

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let err = policy
        .run(&cancel, |attempt| flaky(&calls, attempt, 99))
        .await
        .unwrap_err();

    match err {
        RetryError::Cancelled { attempts, last } => {
            assert_eq!(attempts, 1);
            assert_eq!(last.as_deref(), Some("fail 1"));
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn failure_after_cancellation_on_last_attempt_is_cancelled() {
    let policy = RetryPolicy::new(1, ms(10), ms(0));
    let cancel = CancellationToken::new();

    let err = policy
        .run(&cancel, |_attempt| {
            let cancel = cancel.clone();
            async move {
                cancel.cancel();
                Err::<(), _>("interrupted".to_string())
            }
        })
        .await
        .unwrap_err();

    match err {
        RetryError::Cancelled { attempts, last } => {
            assert_eq!(attempts, 1);
            assert_eq!(last.as_deref(), Some("interrupted"));
        }
        other => panic!("expected Cancelled, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_before_start_never_calls_action() {
    let policy = RetryPolicy::new(3, ms(10), ms(0));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let calls = AtomicU32::new(0);

    let err = policy
        .run(&cancel, |attempt| flaky(&calls, attempt, 1))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.attempts(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
