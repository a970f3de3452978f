use std::sync::Arc;
use std::time::Duration;

use operation_consumer::error::BatchError;
use operation_consumer::kafka::partition_router::{shutdown_workers, PartitionRouter};
use operation_consumer::kafka::partition_worker::PartitionWorkerConfig;
use operation_consumer::kafka::rebalance_handler::RebalanceHandler;
use operation_consumer::record::RawRecord;
use operation_consumer::test_utils::{operation_record, ScriptedHandler};
use operation_consumer::types::{PartitionAssignment, PartitionKey};
use tokio::sync::mpsc;

mod common;
use common::{kind, operations, Harness, TOPIC};

#[tokio::test]
async fn test_reassign_replays_from_last_commit() {
    let harness = Harness::with_concurrency(ScriptedHandler::new().fail_on(&kind(3)), 4);
    harness.assign(Some(0));

    harness
        .consumer
        .deliver_batch(operations(1..=5), &harness.key)
        .await
        .unwrap();
    assert_eq!(harness.committed(), vec![2]);

    harness.consumer.on_revoke(&harness.key);
    assert!(harness.consumer.arena().get(&harness.key).is_none());

    // the group resumes after the last committed watermark, not the last attempt
    harness.handler.recover(&kind(3));
    harness.assign(harness.coordinator.last_committed(&harness.key));

    let tracked = harness.consumer.arena().get(&harness.key).unwrap();
    assert_eq!(tracked.watermark(), Some(2));
    assert_eq!(tracked.stalled_at(), None);

    let outcome = harness
        .consumer
        .deliver_batch(operations(3..=5), &harness.key)
        .await
        .unwrap();

    assert_eq!(outcome.committed, Some(5));
    assert_eq!(harness.committed(), vec![2, 5]);
}

#[tokio::test]
async fn test_results_of_revoked_partition_are_discarded() {
    let harness = Harness::with_concurrency(
        ScriptedHandler::new().delay(&kind(1), Duration::from_millis(100)),
        4,
    );
    harness.assign(Some(0));

    let consumer = harness.consumer.clone();
    let key = harness.key.clone();
    let in_flight =
        tokio::spawn(async move { consumer.deliver_batch(operations(1..=2), &key).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.consumer.on_revoke(&harness.key);

    let outcome = in_flight.await.unwrap().unwrap();
    assert!(outcome.discarded);
    assert_eq!(outcome.committed, None);
    assert_eq!(harness.handler.completed().len(), 2);
    assert!(harness.committed().is_empty());
}

#[tokio::test]
async fn test_reassignment_during_flight_does_not_resurrect_old_results() {
    let harness = Harness::with_concurrency(
        ScriptedHandler::new().delay(&kind(1), Duration::from_millis(100)),
        4,
    );
    harness.assign(Some(0));

    let consumer = harness.consumer.clone();
    let key = harness.key.clone();
    let in_flight =
        tokio::spawn(async move { consumer.deliver_batch(operations(1..=2), &key).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.consumer.on_revoke(&harness.key);
    harness.assign(Some(0));

    let outcome = in_flight.await.unwrap().unwrap();
    assert!(outcome.discarded);
    assert!(harness.committed().is_empty());

    let tracked = harness.consumer.arena().get(&harness.key).unwrap();
    assert_eq!(tracked.watermark(), Some(0));
}

#[tokio::test]
async fn test_partitions_progress_independently() {
    let harness = Harness::with_concurrency(ScriptedHandler::new().fail_on(&kind(1)), 4);
    let stalled = PartitionKey::new(TOPIC, 0);
    let healthy = PartitionKey::new(TOPIC, 1);
    harness.consumer.on_partitions_assigned(&[
        PartitionAssignment::new(stalled.clone(), Some(0)),
        PartitionAssignment::new(healthy.clone(), Some(10)),
    ]);

    let healthy_batch = (11..=13)
        .map(|offset| operation_record(offset, "ok"))
        .collect();
    let (left, right) = tokio::join!(
        harness.consumer.deliver_batch(operations(1..=3), &stalled),
        harness.consumer.deliver_batch(healthy_batch, &healthy),
    );

    assert_eq!(left.unwrap().stalled_at, Some(1));
    assert_eq!(right.unwrap().committed, Some(13));
    assert!(harness.coordinator.committed_offsets(&stalled).is_empty());
    assert_eq!(harness.coordinator.committed_offsets(&healthy), vec![13]);
}

#[tokio::test]
async fn test_router_delivers_batches_through_partition_workers() {
    let harness = Harness::with_concurrency(ScriptedHandler::new(), 4);
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let router = PartitionRouter::new(
        harness.consumer.clone(),
        fatal_tx,
        PartitionWorkerConfig::default(),
    );

    router.on_partitions_assigned(&[PartitionAssignment::new(harness.key.clone(), Some(0))]);
    assert!(router.has_partition(&harness.key));
    assert!(harness.consumer.arena().get(&harness.key).is_some());

    router
        .route_batch(harness.key.clone(), operations(1..=3), 1)
        .await
        .unwrap();
    router
        .route_batch(harness.key.clone(), operations(4..=6), 2)
        .await
        .unwrap();

    shutdown_workers(router.shutdown_all()).await;

    assert_eq!(harness.committed(), vec![3, 6]);
    assert!(fatal_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_router_reports_corrupt_batches_as_fatal() {
    let harness = Harness::with_concurrency(ScriptedHandler::new(), 4);
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let router = Arc::new(PartitionRouter::new(
        harness.consumer.clone(),
        fatal_tx,
        PartitionWorkerConfig::default(),
    ));
    router.on_partitions_assigned(&[PartitionAssignment::new(harness.key.clone(), Some(0))]);

    router
        .route_batch(
            harness.key.clone(),
            vec![RawRecord::at(1, vec![0xc3, 0x28])],
            1,
        )
        .await
        .unwrap();

    let fatal = tokio::time::timeout(Duration::from_secs(5), fatal_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(fatal, BatchError::Decode(_)));

    shutdown_workers(router.shutdown_all()).await;
}

#[tokio::test]
async fn test_router_revoke_releases_tracker_and_worker() {
    let harness = Harness::with_concurrency(ScriptedHandler::new(), 4);
    let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
    let router = PartitionRouter::new(
        harness.consumer.clone(),
        fatal_tx,
        PartitionWorkerConfig::default(),
    );

    router.on_partitions_assigned(&[harness.key.clone().into()]);
    router.on_partitions_revoked(&[harness.key.clone()]);

    assert!(!router.has_partition(&harness.key));
    assert!(harness.consumer.arena().get(&harness.key).is_none());
    assert!(router
        .route_batch(harness.key.clone(), operations(1..=1), 1)
        .await
        .is_err());
}

#[tokio::test]
async fn test_router_reassign_refuses_batches_queued_under_old_assignment() {
    let harness = Harness::with_concurrency(
        ScriptedHandler::new()
            .delay(&kind(40), Duration::from_millis(100))
            .fail_on("retry-40"),
        4,
    );
    let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
    let router = PartitionRouter::new(
        harness.consumer.clone(),
        fatal_tx,
        PartitionWorkerConfig::default(),
    );

    router.on_partitions_assigned(&[harness.key.clone().into()]);
    router
        .route_batch(harness.key.clone(), operations(40..=41), 1)
        .await
        .unwrap();
    router
        .route_batch(harness.key.clone(), operations(50..=51), 2)
        .await
        .unwrap();

    // 40..=41 is in flight and 50..=51 still queued when the partition moves
    tokio::time::sleep(Duration::from_millis(20)).await;
    router.on_partitions_revoked(&[harness.key.clone()]);
    router.on_partitions_assigned(&[harness.key.clone().into()]);

    let redelivered = vec![
        operation_record(40, "retry-40"),
        operation_record(41, "retry-41"),
    ];
    router
        .route_batch(harness.key.clone(), redelivered, 3)
        .await
        .unwrap();
    shutdown_workers(router.shutdown_all()).await;

    // let the replaced worker finish its in-flight batch and drain its queue
    tokio::time::timeout(Duration::from_secs(5), async {
        while !harness.handler.completed().contains(&kind(40)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(harness.committed().is_empty());
    assert!(!harness.handler.started().contains(&kind(50)));
    let tracked = harness.consumer.arena().get(&harness.key).unwrap();
    assert_eq!(tracked.watermark(), Some(39));
    assert_eq!(tracked.stalled_at(), Some(40));
}
