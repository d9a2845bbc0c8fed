//! Integration tests for the embedded sqlite store and hibernation publisher.
//!
//! Runs entirely against an in-memory sqlite database, so no external
//! service or feature gate is required.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use futures::StreamExt;
use pubsub_core::channel::Channel;
use pubsub_core::publisher::{Publisher, SubscribeOptions};
use pubsub_core::serializer::{SerializedPayload, TypeRegistry};
use pubsub_core::store::EventStore;
use pubsub_embedded::{EmbeddedPublisher, EmbeddedStore};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

fn payload(value: serde_json::Value) -> SerializedPayload {
    let registry = TypeRegistry::new();
    pubsub_core::serializer::serialize(&value, &registry).expect("payload serializes")
}

async fn store(retention: Duration) -> Arc<EmbeddedStore> {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite connects");
    let store = EmbeddedStore::new(pool, retention);
    store.ensure_schema().await.expect("schema creates");
    Arc::new(store)
}

#[tokio::test]
async fn store_append_and_read_since_round_trip() {
    let store = store(Duration::from_secs(3600)).await;
    let channel = Channel::new("it", "round-trip");

    let id1 = store.append(&channel, "one").await.expect("append 1");
    let id2 = store.append(&channel, "two").await.expect("append 2");
    assert!(id1 < id2);

    let replayed = store
        .read_since(&channel, Some(&id1))
        .await
        .expect("read since");
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].payload, "two");
}

#[tokio::test]
async fn publisher_delivers_live_events_to_an_attached_subscriber() {
    let store = store(Duration::from_secs(3600)).await;
    let publisher = EmbeddedPublisher::without_expiry(Arc::clone(&store) as Arc<dyn EventStore>);
    let channel = Channel::new("it", "live-delivery");

    let mut stream = publisher
        .subscribe_stream(&channel, SubscribeOptions::default())
        .await
        .expect("subscribe");

    publisher
        .publish(&channel, payload(json!({"order": 1})))
        .await
        .expect("publish 1");
    publisher
        .publish(&channel, payload(json!({"order": 2})))
        .await
        .expect("publish 2");

    let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("first event within timeout")
        .expect("stream not closed");
    let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("second event within timeout")
        .expect("stream not closed");

    assert_eq!(first.payload.json, json!({"order": 1}));
    assert_eq!(second.payload.json, json!({"order": 2}));
}

#[tokio::test]
async fn resume_subscriber_receives_only_events_after_last_event_id() {
    let store = store(Duration::from_secs(3600)).await;
    let publisher = EmbeddedPublisher::without_expiry(Arc::clone(&store) as Arc<dyn EventStore>);
    let channel = Channel::new("it", "resume");

    let id1 = publisher
        .publish(&channel, payload(json!({"order": 1})))
        .await
        .expect("publish 1");
    publisher
        .publish(&channel, payload(json!({"order": 2})))
        .await
        .expect("publish 2");
    publisher
        .publish(&channel, payload(json!({"order": 3})))
        .await
        .expect("publish 3");

    let mut stream = publisher
        .subscribe_stream(
            &channel,
            SubscribeOptions {
                last_event_id: Some(id1),
                ..Default::default()
            },
        )
        .await
        .expect("subscribe with resume");

    let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("within timeout")
        .expect("not closed");
    let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("within timeout")
        .expect("not closed");

    assert_eq!(first.payload.json, json!({"order": 2}));
    assert_eq!(second.payload.json, json!({"order": 3}));
}

#[tokio::test]
async fn sweep_retention_removes_events_past_the_window() {
    let store = store(Duration::from_secs(0)).await;
    let channel = Channel::new("it", "sweep");
    store.append(&channel, "stale").await.expect("append");

    tokio::time::sleep(Duration::from_millis(1100)).await;
    store.sweep_retention(&channel).await.expect("sweep");

    let replayed = store.read_since(&channel, None).await.expect("read");
    assert!(replayed.is_empty());
}

#[tokio::test]
async fn two_channels_do_not_observe_each_others_events() {
    let store = store(Duration::from_secs(3600)).await;
    let publisher = EmbeddedPublisher::without_expiry(Arc::clone(&store) as Arc<dyn EventStore>);
    let a = Channel::new("it", "isolation-a");
    let b = Channel::new("it", "isolation-b");

    let mut stream_a = publisher
        .subscribe_stream(&a, SubscribeOptions::default())
        .await
        .expect("subscribe a");

    publisher
        .publish(&b, payload(json!({"channel": "b"})))
        .await
        .expect("publish to b");
    publisher
        .publish(&a, payload(json!({"channel": "a"})))
        .await
        .expect("publish to a");

    let received = tokio::time::timeout(Duration::from_secs(2), stream_a.next())
        .await
        .expect("event within timeout")
        .expect("stream not closed");
    assert_eq!(received.payload.json, json!({"channel": "a"}));
}
