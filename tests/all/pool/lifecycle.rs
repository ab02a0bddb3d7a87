use crate::helpers::{pool_builder, start_pool, FakeBroker};
use carrot_cake_pool::pool::{ChannelPool, LeaseError, PoolError, PoolSettings};
use std::time::Duration;

#[tokio::test]
async fn every_worker_opens_its_channels_on_start() {
    let broker = FakeBroker::new();
    let pool = start_pool(&broker, 3, 4).await;

    assert_eq!(3, pool.worker_count());
    assert_eq!(3, broker.open_connections());
    assert_eq!(12, broker.open_channels());
    for worker in 0..3 {
        let state = pool.describe_state(worker).await.unwrap();
        assert_eq!(worker, state.worker.slot);
        assert_eq!(1, state.worker.incarnation);
        assert_eq!((4, 0, 0, 0), (state.idle, state.leased, state.reclaimed, state.failed));
    }
    assert_eq!(
        LeaseError::ConnectionUnavailable,
        pool.describe_state(3).await.unwrap_err()
    );
}

#[tokio::test]
async fn a_pool_without_workers_or_channels_is_rejected() {
    let broker = FakeBroker::new();

    let no_workers = pool_builder(&broker).workers(0).start().await;
    assert!(matches!(no_workers, Err(PoolError::InvalidConfiguration(_))));

    let no_channels = pool_builder(&broker).channels_per_worker(0).start().await;
    assert!(matches!(no_channels, Err(PoolError::InvalidConfiguration(_))));

    assert_eq!(0, broker.open_connections());
}

#[tokio::test]
async fn a_pool_does_not_start_if_the_broker_is_unreachable() {
    let broker = FakeBroker::new();
    broker.refuse_connections(true);

    let outcome = pool_builder(&broker).workers(2).start().await;

    assert!(matches!(outcome, Err(PoolError::Connect(_))));
    assert_eq!(0, broker.open_connections());
}

#[tokio::test]
async fn shutting_down_closes_every_channel_and_connection() {
    let broker = FakeBroker::new();
    let pool = start_pool(&broker, 2, 3).await;
    let lease = pool.checkout().await.unwrap();

    pool.shutdown().await;

    assert_eq!(0, broker.open_connections());
    assert_eq!(0, broker.open_channels());
    assert!(lease.publish().is_err());
    assert_eq!(
        LeaseError::ConnectionUnavailable,
        pool.checkout().await.unwrap_err()
    );
    // Returning a lease to a stopped worker is harmless.
    drop(lease);
    // So is shutting down twice.
    pool.shutdown().await;
}

#[tokio::test]
async fn a_pool_can_be_configured_from_settings() {
    let broker = FakeBroker::new();
    let settings: PoolSettings = serde_json::from_value(serde_json::json!({
        "name": "ledger",
        "worker_count": "2",
        "channels_per_worker": 5,
        "max_overflow": 1,
        "restart_delay_milliseconds": 20,
        "queues": [
            { "queue_name": "ledger.entries", "exchange_name": "ledger" }
        ]
    }))
    .unwrap();
    assert_eq!(Duration::from_millis(20), settings.restart_delay());

    let pool = settings
        .configure(ChannelPool::builder(broker.clone()))
        .start()
        .await
        .unwrap();

    assert_eq!("ledger", pool.id().as_str());
    assert_eq!(2, pool.worker_count());
    assert_eq!(10, broker.open_channels());
    assert!(broker.queues().contains("ledger.entries"));
}
