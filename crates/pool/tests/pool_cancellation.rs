//! Dropping an `acquire` future mid-flight must not leak pool capacity.

use std::time::Duration;

use pretty_assertions::assert_eq;
use resync_pool::testing::MockConnector;
use resync_pool::{Pool, PoolConfig, RetryConfig};

fn pool(max: usize) -> (Pool<MockConnector>, MockConnector) {
    let connector = MockConnector::new();
    let config = PoolConfig::default()
        .with_size(0, max)
        .with_connect_retry(RetryConfig::none());
    (Pool::new("db", connector.clone(), config).unwrap(), connector)
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiter_leaves_no_slot_behind() {
    let (pool, _) = pool(1);
    let mut held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = pool.clone();
    let cancelled = tokio::time::timeout(Duration::from_millis(50), async move {
        waiter.acquire(Duration::from_secs(60)).await
    })
    .await;
    assert!(cancelled.is_err(), "outer timeout should fire first");

    let metrics = pool.metrics();
    assert_eq!(metrics.waiters, 0);
    // The abandoned wait is not an acquisition failure.
    assert_eq!(metrics.acquisition_errors, 0);

    held.release(true).unwrap();
    let lease = pool.acquire(Duration::from_millis(10)).await.unwrap();
    assert_eq!(lease.get().unwrap().id, 0);
}

#[tokio::test(start_paused = true)]
async fn aborted_task_frees_its_queue_position() {
    let (pool, _) = pool(1);
    let mut held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = pool.clone();
    let task = tokio::spawn(async move { waiter.acquire(Duration::from_secs(60)).await });
    tokio::task::yield_now().await;
    assert_eq!(pool.metrics().waiters, 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(pool.metrics().waiters, 0);

    held.release(true).unwrap();
    assert!(pool.acquire(Duration::from_millis(10)).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn cancelled_connect_releases_its_reservation() {
    let (pool, connector) = pool(1);
    connector.set_connect_delay(Duration::from_secs(5));

    let attempt = tokio::time::timeout(
        Duration::from_secs(1),
        pool.acquire(Duration::from_secs(30)),
    )
    .await;
    assert!(attempt.is_err());

    let metrics = pool.metrics();
    assert_eq!((metrics.active, metrics.idle), (0, 0));

    connector.set_connect_delay(Duration::ZERO);
    let lease = pool.acquire(Duration::from_millis(10)).await.unwrap();
    assert_eq!(connector.connects(), 1);
    drop(lease);
}

#[tokio::test(start_paused = true)]
async fn connect_slower_than_the_deadline_times_out() {
    let (pool, connector) = pool(1);
    connector.set_connect_delay(Duration::from_secs(5));

    let err = pool.acquire(Duration::from_millis(200)).await.unwrap_err();
    assert!(matches!(err, resync_pool::Error::AcquisitionTimeout { .. }), "{err:?}");
    assert_eq!(pool.metrics().timeouts, 1);

    connector.set_connect_delay(Duration::ZERO);
    assert!(pool.acquire(Duration::from_millis(10)).await.is_ok());
}
