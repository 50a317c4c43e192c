use crate::helpers::{AckState, NotificationBuilder, RecordingAcker, RecordingPublisher, RecordingTransfer, ScriptedSource};
use glance_image_sync::config::FanoutFailurePolicy;
use glance_image_sync::core::routing::node_routing_key;
use glance_image_sync::core::{NodeList, RetryPolicy};
use glance_image_sync::monitoring::Metrics;
use glance_image_sync::relay::Duplicator;
use glance_image_sync::sync::{ImageStore, SyncWorker, SyncWorkerSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn worker_for(
    hostname: &str,
    datadir: &std::path::Path,
    transfer: RecordingTransfer,
    metrics: Arc<Metrics>,
) -> SyncWorker<RecordingTransfer> {
    SyncWorker::new(
        ImageStore::new(datadir),
        transfer,
        SyncWorkerSettings {
            hostname: hostname.to_string(),
            rsync_user: "glance".to_string(),
            transfer_retry: RetryPolicy::none(),
            delete_recheck_attempts: 0,
            delete_recheck_interval: Duration::from_millis(1),
            in_flight_marker_max_age: Duration::from_secs(900),
        },
        metrics,
    )
}

/// Relay an update and a delete published by node2 and apply the relayed
/// copies on both nodes.
#[tokio::test]
async fn test_update_and_delete_reach_every_node() {
    let metrics = Arc::new(Metrics::new());
    let publisher = RecordingPublisher::new();
    let duplicator = Duplicator::new(
        publisher.clone(),
        NodeList::parse("node1.example.com,node2.example.com"),
        "relay",
        RetryPolicy::none(),
        FanoutFailurePolicy::Requeue,
        metrics.clone(),
    );

    let builder = NotificationBuilder::new().from_publisher("node2.example.com");
    let central_ackers = [RecordingAcker::new(), RecordingAcker::new()];
    let mut central = ScriptedSource::new(
        "notifications.info",
        vec![
            central_ackers[0].delivery(builder.image_update("abc"), false),
            central_ackers[1].delivery(builder.image_delete("stale"), false),
        ],
    );

    let stats = duplicator
        .run(&mut central, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.acked, 2);
    for acker in &central_ackers {
        assert_eq!(acker.state(), AckState::Acked);
    }

    for (node, expect_pull) in [("node1.example.com", true), ("node2.example.com", false)] {
        let datadir = tempfile::tempdir().unwrap();
        std::fs::write(datadir.path().join("stale"), b"old image").unwrap();

        let transfer = RecordingTransfer::writing_files();
        let worker = worker_for(node, datadir.path(), transfer.clone(), metrics.clone());

        let routing_key = node_routing_key("relay", node);
        let queued = publisher.queue(&routing_key);
        assert_eq!(queued.len(), 2, "{routing_key} should hold both notifications");

        let (deliveries, ackers): (Vec<_>, Vec<_>) = queued.into_iter().unzip();
        let mut source = ScriptedSource::new(&routing_key, deliveries);
        let stats = worker.run(&mut source, CancellationToken::new()).await.unwrap();

        assert_eq!(stats.processed, 2);
        for acker in &ackers {
            assert_eq!(acker.state(), AckState::Acked);
        }

        // The publishing node already has the image and must not pull it.
        assert_eq!(transfer.requests().len(), usize::from(expect_pull));
        assert_eq!(datadir.path().join("abc").exists(), expect_pull);
        assert!(!datadir.path().join("stale").exists());
    }

    let snapshot = metrics.get_snapshot().await;
    assert_eq!(snapshot.fanout_publishes, 4);
    assert_eq!(snapshot.transfers_succeeded, 1);
    assert_eq!(snapshot.deletes, 2);
}
