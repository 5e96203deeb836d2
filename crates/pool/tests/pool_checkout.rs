//! Checkout and return paths of a single pool.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pretty_assertions::assert_eq;
use resync_pool::testing::MockConnector;
use resync_pool::{ConnectionHealth, Error, Pool, PoolConfig, RetryConfig};
use tokio::time::Instant;

fn pool(min: usize, max: usize) -> (Pool<MockConnector>, MockConnector) {
    let connector = MockConnector::new();
    let config = PoolConfig::default()
        .with_size(min, max)
        .with_connect_retry(RetryConfig::none());
    let pool = Pool::new("db", connector.clone(), config).unwrap();
    (pool, connector)
}

/// Let spawned close tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn sixth_caller_times_out_when_five_are_held() {
    let (pool, _) = pool(2, 5);

    let held: Vec<_> = join_all((0..5).map(|_| pool.acquire(Duration::from_secs(1))))
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(held.len(), 5);

    let started = Instant::now();
    let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(100), "returned early: {waited:?}");
    assert!(waited < Duration::from_millis(150), "returned late: {waited:?}");

    match err {
        Error::AcquisitionTimeout {
            ref resource,
            timeout_ms,
            pool_size,
            max_size,
            ..
        } => {
            assert_eq!(resource, "db");
            assert_eq!((timeout_ms, pool_size, max_size), (100, 5, 5));
        }
        other => panic!("expected AcquisitionTimeout, got {other:?}"),
    }
    assert!(err.is_retryable());

    let metrics = pool.metrics();
    assert_eq!(metrics.active, 5);
    assert_eq!(metrics.acquisition_errors, 1);
    assert_eq!(metrics.timeouts, 1);
    assert_eq!(metrics.exhaustions, 1);
    assert_eq!(metrics.waiters, 0);
}

#[tokio::test(start_paused = true)]
async fn released_connection_is_reused() {
    let (pool, connector) = pool(0, 3);

    let mut lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let first = lease.id();
    assert_eq!(lease.info().use_count, 1);
    pool.release(&mut lease, true).unwrap();

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(lease.id(), first);
    assert_eq!(lease.info().use_count, 2);
    assert_eq!(lease.info().health, ConnectionHealth::Healthy);
    assert_eq!(connector.connects(), 1);

    let metrics = pool.metrics();
    assert_eq!(metrics.pool_hits, 1);
    assert_eq!(metrics.pool_misses, 1);
    assert_eq!(metrics.successful_acquisitions, 2);
}

#[tokio::test(start_paused = true)]
async fn most_recently_released_is_served_first() {
    let (pool, _) = pool(0, 3);

    let mut a = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let mut b = pool.acquire(Duration::from_secs(1)).await.unwrap();
    a.release(true).unwrap();
    b.release(true).unwrap();

    let next = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(next.id(), b.id());
}

#[tokio::test(start_paused = true)]
async fn waiters_are_served_in_arrival_order() {
    let (pool, _) = pool(0, 1);
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let mut tasks = Vec::new();
    for label in ["first", "second"] {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let mut lease = pool.acquire(Duration::from_secs(10)).await.unwrap();
            order.lock().push(label);
            lease.release(true).unwrap();
        }));
        tokio::task::yield_now().await;
    }
    assert_eq!(pool.metrics().waiters, 2);

    held.release(true).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*order.lock(), vec!["first", "second"]);
}

#[tokio::test(start_paused = true)]
async fn double_release_is_rejected_without_touching_counts() {
    let (pool, _) = pool(0, 3);
    let mut lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    lease.release(true).unwrap();
    let before = pool.metrics();

    let err = lease.release(true).unwrap_err();
    assert!(matches!(err, Error::DoubleRelease { .. }), "{err:?}");
    assert!(!err.is_retryable());

    let after = pool.metrics();
    assert_eq!((after.active, after.idle), (before.active, before.idle));
    assert_eq!((after.active, after.idle), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn lease_is_unusable_after_release() {
    let (pool, _) = pool(0, 1);
    let mut lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(lease.get().unwrap().id, 0);

    lease.release(true).unwrap();
    assert!(lease.is_released());
    assert!(matches!(lease.get(), Err(Error::UseAfterRelease { .. })));
    assert!(matches!(lease.get_mut(), Err(Error::UseAfterRelease { .. })));
}

#[tokio::test(start_paused = true)]
async fn unhealthy_release_destroys_the_connection() {
    let (pool, connector) = pool(0, 2);
    let mut lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    lease.release(false).unwrap();
    settle().await;

    let metrics = pool.metrics();
    assert_eq!((metrics.active, metrics.idle), (0, 0));
    assert_eq!(metrics.total_destroyed, 1);
    assert_eq!(connector.closes(), 1);

    // The slot is free again.
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(lease.get().unwrap().id, 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_lease_returns_to_idle() {
    let (pool, connector) = pool(0, 1);
    {
        let _lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    }
    let metrics = pool.metrics();
    assert_eq!((metrics.active, metrics.idle), (0, 1));

    let lease = pool.acquire(Duration::from_millis(10)).await.unwrap();
    assert_eq!(lease.info().use_count, 2);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn lease_from_another_pool_is_refused() {
    let (db, _) = pool(0, 1);
    let cache = Pool::new(
        "cache",
        MockConnector::new(),
        PoolConfig::default().with_size(0, 1),
    )
    .unwrap();

    let mut lease = cache.acquire(Duration::from_secs(1)).await.unwrap();
    let err = db.release(&mut lease, true).unwrap_err();
    match err {
        Error::ForeignConnection { expected, actual } => {
            assert_eq!((expected.as_str(), actual.as_str()), ("db", "cache"));
        }
        other => panic!("expected ForeignConnection, got {other:?}"),
    }
    assert!(!lease.is_released());
    cache.release(&mut lease, true).unwrap();
}

#[tokio::test(start_paused = true)]
async fn dead_idle_connection_is_replaced_on_checkout() {
    let (pool, connector) = pool(0, 2);
    let mut lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    lease.release(true).unwrap();

    connector.set_dead(true);
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(lease.get().unwrap().id, 1);
    settle().await;

    assert_eq!(connector.closes(), 1);
    let metrics = pool.metrics();
    assert_eq!(metrics.total_created, 2);
    assert_eq!(metrics.total_destroyed, 1);
    assert_eq!((metrics.active, metrics.idle), (1, 0));
}

#[tokio::test(start_paused = true)]
async fn warm_up_fills_to_min_size() {
    let (pool, connector) = pool(3, 5);
    assert_eq!(pool.warm_up().await, 3);
    assert_eq!(pool.metrics().idle, 3);
    assert_eq!(connector.connects(), 3);

    // Already at the floor.
    assert_eq!(pool.warm_up().await, 0);
}
