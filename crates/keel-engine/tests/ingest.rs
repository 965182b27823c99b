//! Broker-to-workspace ingest: commit, skip and rewind

use chrono::{TimeZone, Utc};
use keel_broker::{Consumer, MemoryBroker, Producer};
use keel_engine::{Envelope, Ingestor, Outcome, SetResources, Workspace};
use keel_queue::{MemoryQueue, ReconcileQueue};
use keel_types::{CancelToken, ManualClock, Resource, ResourceProvider};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "workspace-events";

fn envelope<T: serde::Serialize>(workspace_id: &str, event_type: &str, data: &T) -> Vec<u8> {
    let at = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
    Envelope::new(workspace_id, event_type.parse().unwrap(), at, data)
        .unwrap()
        .encode()
        .unwrap()
}

fn setup() -> (Arc<MemoryBroker>, Arc<Workspace>, Ingestor) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap());
    let queue: Arc<dyn ReconcileQueue> = Arc::new(MemoryQueue::new(Arc::new(clock.clone())));
    let workspace = Workspace::builder("ws", queue)
        .with_clock(Arc::new(clock))
        .build();
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, 1);
    let consumer = broker.consumer(TOPIC, "keel-engine").unwrap();
    let ingestor = Ingestor::new(Arc::new(consumer), workspace.clone())
        .with_read_timeout(Duration::from_millis(20));
    (broker, workspace, ingestor)
}

#[tokio::test]
async fn applies_own_events_and_skips_the_rest() {
    let (broker, workspace, ingestor) = setup();
    let producer = broker.producer(TOPIC).unwrap();
    let at = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();

    producer
        .publish(b"ws", &envelope("ws", "resource.created", &Resource::new("r1", "cluster-1", at)))
        .await
        .unwrap();
    producer
        .publish(b"ws", &envelope("other", "resource.created", &Resource::new("r2", "cluster-2", at)))
        .await
        .unwrap();
    producer.publish(b"ws", b"not json").await.unwrap();

    let cancel = CancelToken::never();
    assert_eq!(ingestor.poll(&cancel).await.unwrap(), Some(Outcome::Applied));
    assert_eq!(ingestor.poll(&cancel).await.unwrap(), Some(Outcome::Skipped));
    assert_eq!(ingestor.poll(&cancel).await.unwrap(), Some(Outcome::Skipped));
    assert_eq!(ingestor.poll(&cancel).await.unwrap(), None);

    assert!(workspace.store().resources.contains("r1"));
    assert!(!workspace.store().resources.contains("r2"));
}

#[tokio::test]
async fn bad_event_is_committed_and_does_not_block() {
    let (broker, workspace, ingestor) = setup();
    let producer = broker.producer(TOPIC).unwrap();
    let at = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();

    producer
        .publish(b"ws", &envelope("ws", "resource.created", &serde_json::json!({"id": 7})))
        .await
        .unwrap();
    producer
        .publish(b"ws", &envelope("ws", "resource.created", &Resource::new("r1", "cluster-1", at)))
        .await
        .unwrap();

    let cancel = CancelToken::never();
    assert!(matches!(
        ingestor.poll(&cancel).await.unwrap(),
        Some(Outcome::Failed(_))
    ));
    assert_eq!(ingestor.poll(&cancel).await.unwrap(), Some(Outcome::Applied));
    assert!(workspace.store().resources.contains("r1"));

    let consumer = broker.consumer(TOPIC, "keel-engine").unwrap();
    assert_eq!(consumer.committed_offset(0).await.unwrap(), Some(2));
}

#[tokio::test]
async fn missing_batch_is_deferred_and_reread() {
    let (broker, workspace, ingestor) = setup();
    let producer = broker.producer(TOPIC).unwrap();
    let at = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();

    producer
        .publish(
            b"ws",
            &envelope(
                "ws",
                "resource-provider.created",
                &ResourceProvider {
                    id: "aws".into(),
                    workspace_id: "ws".into(),
                    name: "aws".into(),
                    metadata: BTreeMap::new(),
                    created_at: at,
                },
            ),
        )
        .await
        .unwrap();
    let cancel = CancelToken::never();
    assert_eq!(ingestor.poll(&cancel).await.unwrap(), Some(Outcome::Applied));

    producer
        .publish(
            b"ws",
            &envelope(
                "ws",
                "resource-provider.set-resources",
                &SetResources {
                    provider_id: "aws".into(),
                    batch_id: "not-yet".into(),
                },
            ),
        )
        .await
        .unwrap();

    assert!(matches!(
        ingestor.poll(&cancel).await.unwrap(),
        Some(Outcome::Deferred(_))
    ));
    assert!(matches!(
        ingestor.poll(&cancel).await.unwrap(),
        Some(Outcome::Deferred(_))
    ));
    assert!(workspace.store().resources_for_provider("aws").is_empty());
}
