//! The per-pool background loops driven through the manager: the health
//! monitor (including restart after a panic) and the auto-scaler.

use std::time::Duration;

use pretty_assertions::assert_eq;
use resync_pool::testing::MockConnector;
use resync_pool::{
    AutoScalePolicy, LoadWeights, ManagerConfig, PoolConfig, PoolEvent, PoolManager,
    ScaleDirection,
};

fn monitored(interval: Duration) -> PoolConfig {
    PoolConfig {
        health_check_interval: interval,
        ..PoolConfig::default().with_size(1, 4)
    }
}

fn without_autoscale() -> ManagerConfig {
    ManagerConfig {
        autoscale: AutoScalePolicy {
            enabled: false,
            ..AutoScalePolicy::default()
        },
        ..ManagerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn monitor_probes_on_its_interval() {
    let manager = PoolManager::new(without_autoscale()).unwrap();
    let connector = MockConnector::new();
    manager
        .register("db", connector.clone(), monitored(Duration::from_secs(10)))
        .unwrap();
    manager.start().await.unwrap();
    assert!(manager.get_metrics("db").unwrap().last_health_check.is_none());

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(connector.probes(), 2);
    let metrics = manager.get_metrics("db").unwrap();
    assert!(metrics.last_health_check.is_some());
    assert_eq!(metrics.last_probe.map(|p| p.probed), Some(1));

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn monitor_restarts_after_a_panic() {
    let manager = PoolManager::new(without_autoscale()).unwrap();
    let mut rx = manager.subscribe();
    let connector = MockConnector::new();
    manager
        .register("db", connector.clone(), monitored(Duration::from_secs(1)))
        .unwrap();
    manager.start().await.unwrap();
    connector.panic_next_probes(1);

    // t=1 the probe panics; restart after 1s; next cycle at t=3.
    tokio::time::sleep(Duration::from_millis(3500)).await;

    let metrics = manager.get_metrics("db").unwrap();
    assert_eq!(metrics.monitor_restarts, 1);
    assert_eq!(connector.probes(), 2);
    assert!(metrics.last_health_check.is_some());
    // The connection lost in the panic was replaced.
    assert_eq!(metrics.idle, 1);

    let mut restarts = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PoolEvent::MonitorRestarted { resource, restarts: n } = event {
            restarts.push((resource, n));
        }
    }
    assert_eq!(restarts, vec![("db".to_string(), 1)]);

    // Shutdown still stops the restarted loop.
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn autoscaler_steps_up_once_per_cycle_to_the_hard_ceiling() {
    let policy = AutoScalePolicy {
        scale_up_threshold: 0.4,
        scale_down_threshold: 0.3,
        weights: LoadWeights {
            utilization: 1.0,
            latency: 0.0,
            errors: 0.0,
            queue: 0.0,
        },
        ..AutoScalePolicy::default()
    };
    let manager = PoolManager::new(ManagerConfig {
        autoscale: policy,
        ..ManagerConfig::default()
    })
    .unwrap();
    let mut rx = manager.subscribe();
    manager
        .register("db", MockConnector::new(), PoolConfig::default().with_size(1, 2).with_hard_max(6))
        .unwrap();
    manager.start().await.unwrap();

    let _a = manager.acquire::<MockConnector>("db", Duration::from_secs(1)).await.unwrap();
    let _b = manager.acquire::<MockConnector>("db", Duration::from_secs(1)).await.unwrap();

    // Evaluations at 15s, 30s and 45s; the score has been high for 30s at 45s.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(manager.get_metrics("db").unwrap().max_size, 2);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(manager.get_metrics("db").unwrap().max_size, 4);

    // Two of four busy is still above 0.4.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(manager.get_metrics("db").unwrap().max_size, 6);

    // Two of six sits between the thresholds.
    tokio::time::sleep(Duration::from_secs(60)).await;
    let metrics = manager.get_metrics("db").unwrap();
    assert_eq!((metrics.min_size, metrics.max_size), (1, 6));

    let mut steps = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PoolEvent::Scaled { decision, .. } = event {
            assert_eq!(decision.direction, ScaleDirection::Up);
            steps.push((decision.current_max, decision.target_max));
        }
    }
    assert_eq!(steps, vec![(2, 4), (4, 6)]);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn autoscaler_shrinks_an_idle_pool_to_its_floor() {
    let policy = AutoScalePolicy {
        scale_down_sustain: Duration::from_secs(30),
        ..AutoScalePolicy::default()
    };
    let manager = PoolManager::new(ManagerConfig {
        autoscale: policy,
        ..ManagerConfig::default()
    })
    .unwrap();
    manager
        .register("db", MockConnector::new(), PoolConfig::default().with_size(2, 4))
        .unwrap();
    manager.start().await.unwrap();

    // Low from 15s; steps at 45s and 60s; 2 is the floor.
    tokio::time::sleep(Duration::from_secs(100)).await;
    let metrics = manager.get_metrics("db").unwrap();
    assert_eq!((metrics.min_size, metrics.max_size), (2, 2));
    assert_eq!(metrics.idle, 2);

    manager.shutdown().await;
}
