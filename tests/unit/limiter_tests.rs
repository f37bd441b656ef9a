/*!
 * Tests for the concurrency limiter under contention
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use yastq::app_config::{keys, StaticSettings};
use yastq::scheduler::ConcurrencyLimiter;

/// Test that the in-flight count never exceeds the limit while it changes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limiter_liveReconfiguration_underContention_shouldNeverExceedLimit() {
    let limiter = Arc::new(ConcurrencyLimiter::new(2));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let token = CancellationToken::new();

    let mut handles = Vec::new();
    for i in 0..40 {
        let limiter = Arc::clone(&limiter);
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            let _slot = limiter.acquire(i % 3 == 0, &token).await.unwrap();
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    tokio::time::sleep(Duration::from_millis(5)).await;
    limiter.set_max_concurrency(4).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    limiter.set_max_concurrency(3).await;

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    let stats = limiter.stats();
    assert_eq!(stats.max_concurrency, 3);
    assert_eq!(stats.available, 3);
    assert_eq!(stats.waiting, 0);
}

/// Test that the limit is re-read from settings and clamped
#[tokio::test]
async fn test_limiter_refreshFromSettings_shouldApplyAndClamp() {
    let limiter = ConcurrencyLimiter::new(1);
    let settings = StaticSettings::new([(keys::MAX_CONCURRENT_JOBS, "5")]);

    assert_eq!(limiter.refresh_from_settings(&settings).await.unwrap(), 5);
    assert_eq!(limiter.max_concurrency(), 5);

    settings.set(keys::MAX_CONCURRENT_JOBS, "0");
    limiter.refresh_from_settings(&settings).await.unwrap();
    assert_eq!(limiter.max_concurrency(), 1);

    settings.set(keys::MAX_CONCURRENT_JOBS, "not a number");
    limiter.refresh_from_settings(&settings).await.unwrap();
    assert_eq!(limiter.max_concurrency(), 1);
}

/// Test that every cancelled waiter leaves the queue and no slot is lost
#[tokio::test]
async fn test_limiter_manyCancelledWaiters_shouldKeepCapacityIntact() {
    let limiter = Arc::new(ConcurrencyLimiter::new(1));
    let held = limiter.acquire(false, &CancellationToken::new()).await.unwrap();
    let cancel = CancellationToken::new();

    let mut waiters = Vec::new();
    for i in 0..10 {
        let limiter = Arc::clone(&limiter);
        let cancel = cancel.clone();
        waiters.push(tokio::spawn(async move { limiter.acquire(i % 2 == 0, &cancel).await.is_ok() }));
    }
    while limiter.waiting() < 10 {
        tokio::task::yield_now().await;
    }

    cancel.cancel();
    for waiter in waiters {
        assert!(!waiter.await.unwrap());
    }
    drop(held);

    assert_eq!(limiter.waiting(), 0);
    assert_eq!(limiter.available(), 1);
    assert!(limiter.acquire(true, &CancellationToken::new()).await.is_ok());
}
