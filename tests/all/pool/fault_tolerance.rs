use crate::helpers::{eventually, start_pool, FakeBroker, FakeChannel};
use carrot_cake_pool::pool::LeaseError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn a_panicking_holder_does_not_leak_its_channel() {
    let broker = FakeBroker::new();
    let pool = Arc::new(start_pool(&broker, 1, 2).await);
    let bystander = pool.checkout().await.unwrap();

    let task_pool = Arc::clone(&pool);
    let outcome = tokio::spawn(async move {
        task_pool
            .with_channel(|channel| async move {
                let _channel = channel.unwrap();
                panic!("the holder blew up");
            })
            .await
    })
    .await;
    assert!(outcome.unwrap_err().is_panic());

    let state = eventually(&pool, 0, |s| s.leased == 1).await;
    assert_eq!((1, 1), (state.idle, state.reclaimed));
    // Other leases are untouched.
    bystander.publish().unwrap();
}

#[tokio::test]
async fn an_aborted_holder_does_not_leak_its_channel() {
    let broker = FakeBroker::new();
    let pool = Arc::new(start_pool(&broker, 1, 2).await);
    let bystander = pool.checkout().await.unwrap();

    let task_pool = Arc::clone(&pool);
    let holder = tokio::spawn(async move {
        let _channel = task_pool.checkout().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;
    });
    eventually(&pool, 0, |s| s.leased == 2).await;

    holder.abort();
    assert!(holder.await.unwrap_err().is_cancelled());

    let state = eventually(&pool, 0, |s| s.leased == 1).await;
    assert_eq!((1, 1), (state.idle, state.reclaimed));
    bystander.publish().unwrap();
}

#[tokio::test]
async fn a_channel_closed_by_the_broker_is_replaced() {
    let broker = FakeBroker::new();
    let pool = start_pool(&broker, 1, 2).await;
    let bystander = pool.checkout().await.unwrap();

    let doomed = pool.checkout().await.unwrap();
    let doomed_id = doomed.id();
    doomed.close_from_broker();
    // The holder only finds out when using the channel.
    assert!(doomed.publish().is_err());

    let state = eventually(&pool, 0, |s| s.failed == 1).await;
    assert_eq!((1, 1, 1), (state.idle, state.leased, state.reclaimed));
    assert_eq!(2, broker.open_channels());

    // The holder going away afterwards changes nothing.
    drop(doomed);
    let after_drop = pool.describe_state(0).await.unwrap();
    assert_eq!(state, after_drop);

    let replacement = pool.checkout().await.unwrap();
    assert_ne!(doomed_id, replacement.id());
    assert_ne!(bystander.id(), replacement.id());
    replacement.publish().unwrap();
    bystander.publish().unwrap();
}

#[tokio::test]
async fn an_idle_channel_closed_by_the_broker_is_replaced() {
    let broker = FakeBroker::new();
    let pool = start_pool(&broker, 1, 1).await;

    let lease = pool.checkout().await.unwrap();
    let checkin = lease.checkin_handle();
    let broker_id = FakeChannel::id(&lease);
    checkin.checkin();
    // The channel is idle from the worker's point of view when the broker closes it.
    lease.close_from_broker();
    drop(lease);

    let state = eventually(&pool, 0, |s| s.failed == 1).await;
    assert_eq!((1, 0, 1), (state.idle, state.leased, state.reclaimed));
    let replacement = pool.checkout().await.unwrap();
    assert_ne!(broker_id, FakeChannel::id(&replacement));
}

#[tokio::test]
async fn a_lost_connection_restarts_its_worker_with_fresh_channels() {
    let broker = FakeBroker::new();
    let pool = start_pool(&broker, 1, 3).await;
    let stale = pool.checkout().await.unwrap();
    let stale_ids: HashSet<_> = [stale.id()].into();
    let before = pool.describe_state(0).await.unwrap();
    assert_eq!(1, before.worker.incarnation);

    broker.sever_connections();

    let state = eventually(&pool, 0, |s| s.worker.incarnation > 1).await;
    assert_eq!((3, 0, 0), (state.idle, state.leased, state.reclaimed));
    assert_eq!(0, before.worker.slot);
    assert_eq!(1, broker.open_connections());

    // A lease from the previous connection means nothing to the new worker.
    drop(stale);
    let after_drop = pool.describe_state(0).await.unwrap();
    assert_eq!(state, after_drop);

    let fresh = pool.checkout().await.unwrap();
    assert!(!stale_ids.contains(&fresh.id()));
}

#[tokio::test]
async fn checkouts_fail_fast_while_a_worker_is_restarting() {
    let broker = FakeBroker::new();
    let pool = start_pool(&broker, 1, 1).await;

    broker.refuse_connections(true);
    broker.sever_connections();

    let mut outcome = Ok(());
    for _ in 0..200 {
        outcome = pool.checkout().await.map(drop);
        if outcome.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(Err(LeaseError::ConnectionUnavailable), outcome);
    assert_eq!(
        LeaseError::ConnectionUnavailable,
        pool.describe_state(0).await.unwrap_err()
    );

    // Restarts are retried until the broker is reachable again.
    broker.refuse_connections(false);
    let state = pool.wait_for_worker(0).await.unwrap();
    assert!(state.worker.incarnation > 1);
    assert_eq!(1, state.idle);
    pool.checkout().await.unwrap();
}

#[tokio::test]
async fn a_lost_connection_only_restarts_its_own_worker() {
    let broker = FakeBroker::new();
    let pool = start_pool(&broker, 2, 1).await;
    let doomed = pool.checkout().await.unwrap();
    let survivor = pool.checkout().await.unwrap();

    doomed.sever_connection();

    let mut restarted = None;
    for _ in 0..200 {
        for worker in 0..2 {
            if let Ok(state) = pool.describe_state(worker).await {
                if state.worker.incarnation == 2 {
                    restarted = Some(worker);
                }
            }
        }
        if restarted.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let restarted = restarted.expect("no worker was restarted");

    let other = pool.describe_state(1 - restarted).await.unwrap();
    assert_eq!(1, other.worker.incarnation);
    assert_eq!((0, 1), (other.idle, other.leased));
    survivor.publish().unwrap();
    assert!(doomed.publish().is_err());
    assert_eq!(2, broker.open_connections());
}
