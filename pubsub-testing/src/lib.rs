//! Test doubles for the resumable event publish/subscribe system.
//!
//! [`InMemoryStore`] implements [`pubsub_core::store::EventStore`] over a
//! plain in-process map, and [`InMemoryPublisher`] layers channel fan-out
//! and the iterator subscription form on top of it — the same shape as the
//! embedded backend's `EmbeddedPublisher`, minus the durable storage and
//! hibernation socket fan-out. [`FixedClock`] (re-exported from
//! `pubsub-core`) gives deterministic time for retention and token-expiry
//! tests.

use pubsub_core::channel::Channel;
use pubsub_core::event::{Event, EventId, EventMeta, StoredEvent};
use pubsub_core::publisher::{
    BoxFuture, EventStream, Listener, Publisher, PublisherError, SubscribeOptions, Subscription,
};
use pubsub_core::serializer::SerializedPayload;
use pubsub_core::store::{EventStore, EventStoreError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub use pubsub_core::clock::{Clock, FixedClock, SystemClock};

/// In-memory [`EventStore`]: a per-channel `Vec<StoredEvent>` behind a mutex.
///
/// Ids are assigned as `1`-based stringified sequence numbers per channel,
/// matching the shape (though not the value space) of the embedded
/// backend's sqlite auto-increment ids.
#[derive(Default)]
pub struct InMemoryStore {
    channels: Mutex<HashMap<String, Vec<StoredEvent>>>,
}

impl InMemoryStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryStore {
    fn append<'a>(
        &'a self,
        channel: &'a Channel,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<EventId, EventStoreError>> {
        Box::pin(async move {
            let mut channels = self.channels.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let entries = channels.entry(channel.as_str().to_string()).or_default();
            let next_id = EventId::from((entries.len() + 1).to_string());
            entries.push(StoredEvent {
                id: next_id.clone(),
                payload: payload.to_string(),
                stored_at: 0,
            });
            Ok(next_id)
        })
    }

    fn read_since<'a>(
        &'a self,
        channel: &'a Channel,
        since: Option<&'a EventId>,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>> {
        let since = since.cloned();
        Box::pin(async move {
            let channels = self.channels.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let entries = channels.get(channel.as_str()).cloned().unwrap_or_default();
            Ok(entries
                .into_iter()
                .filter(|event| since.as_ref().is_none_or(|cursor| &event.id > cursor))
                .collect())
        })
    }

    fn sweep_retention<'a>(
        &'a self,
        _channel: &'a Channel,
    ) -> BoxFuture<'a, Result<(), EventStoreError>> {
        // No retention window in the in-memory test double; events live for
        // the lifetime of the store.
        Box::pin(async { Ok(()) })
    }
}

struct Envelope {
    id: EventId,
    payload: SerializedPayload,
}

struct RingBuffer {
    capacity: usize,
    items: VecDeque<Envelope>,
}

impl RingBuffer {
    const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::new(),
        }
    }

    fn push(&mut self, envelope: Envelope) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(envelope);
    }

    fn pop(&mut self) -> Option<Envelope> {
        self.items.pop_front()
    }
}

struct LocalListener {
    id: u64,
    buffer: Mutex<RingBuffer>,
    notify: Notify,
}

type ChannelRegistry = Arc<Mutex<HashMap<String, Vec<Arc<LocalListener>>>>>;

struct ListenerGuard {
    channels: ChannelRegistry,
    channel: String,
    listener_id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let mut channels = self.channels.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(list) = channels.get_mut(&self.channel) {
            list.retain(|listener| listener.id != self.listener_id);
        }
    }
}

/// In-memory [`Publisher`]: fans published events out to attached listeners
/// with the same replay-then-live, high-water-mark-dedup semantics as the
/// durable backends, over an [`InMemoryStore`].
pub struct InMemoryPublisher {
    store: Arc<dyn EventStore>,
    channels: ChannelRegistry,
    next_listener_id: AtomicU64,
}

impl Default for InMemoryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPublisher {
    /// Builds a publisher over a fresh [`InMemoryStore`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()))
    }

    /// Builds a publisher over a caller-supplied store, e.g. to inspect stored
    /// events directly alongside live subscriptions.
    #[must_use]
    pub fn with_store(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
        }
    }

    fn register_listener(&self, channel: &Channel, max_buffered: usize) -> Arc<LocalListener> {
        let listener = Arc::new(LocalListener {
            id: self.next_listener_id.fetch_add(1, Ordering::Relaxed),
            buffer: Mutex::new(RingBuffer::new(max_buffered)),
            notify: Notify::new(),
        });
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(channel.as_str().to_string())
            .or_default()
            .push(Arc::clone(&listener));
        listener
    }

    fn dispatch(&self, channel: &Channel, id: &EventId, payload: &SerializedPayload) {
        let channels = self.channels.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(listeners) = channels.get(channel.as_str()) else {
            return;
        };
        for listener in listeners {
            let mut buffer = listener.buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            buffer.push(Envelope {
                id: id.clone(),
                payload: payload.clone(),
            });
            drop(buffer);
            listener.notify.notify_one();
        }
    }
}

impl Publisher for InMemoryPublisher {
    fn publish<'a>(
        &'a self,
        channel: &'a Channel,
        payload: SerializedPayload,
    ) -> BoxFuture<'a, Result<EventId, PublisherError>> {
        Box::pin(async move {
            let body = serde_json::to_string(&payload.json)
                .map_err(|error| PublisherError::BackendUnavailable(error.to_string()))?;
            let id = self
                .store
                .append(channel, &body)
                .await
                .map_err(|error| PublisherError::BackendUnavailable(error.to_string()))?;
            self.dispatch(channel, &id, &payload);
            Ok(id)
        })
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a Channel,
        listener: Listener,
        options: SubscribeOptions,
    ) -> BoxFuture<'a, Result<Subscription, PublisherError>> {
        Box::pin(async move {
            let mut stream = self.subscribe_stream(channel, options).await?;
            let handle = tokio::spawn(async move {
                use futures::StreamExt;
                while let Some(event) = stream.next().await {
                    listener(event);
                }
            });
            Ok(Subscription::new(move || {
                Box::pin(async move {
                    handle.abort();
                })
            }))
        })
    }

    fn subscribe_stream<'a>(
        &'a self,
        channel: &'a Channel,
        options: SubscribeOptions,
    ) -> BoxFuture<'a, Result<EventStream, PublisherError>> {
        let channel = channel.clone();
        let store = Arc::clone(&self.store);
        let channels_registry = Arc::clone(&self.channels);
        let max_buffered = options.effective_buffer_size();
        let listener = self.register_listener(&channel, max_buffered);

        Box::pin(async move {
            let replayed = store
                .read_since(&channel, options.last_event_id.as_ref())
                .await
                .map_err(|error| PublisherError::ResumeFetch(error.to_string()))?;

            let mut high_water_mark = options.last_event_id;
            for stored in &replayed {
                high_water_mark = Some(stored.id.clone());
            }

            let channel_for_stream = channel.clone();
            let guard = ListenerGuard {
                channels: channels_registry,
                channel: channel.as_str().to_string(),
                listener_id: listener.id,
            };

            let stream = async_stream::stream! {
                let _guard = guard;
                for stored in replayed {
                    let payload: serde_json::Value = serde_json::from_str(&stored.payload)
                        .unwrap_or(serde_json::Value::Null);
                    yield Event {
                        channel: channel_for_stream.clone(),
                        payload: SerializedPayload { json: payload, meta_list: Vec::new() },
                        meta: EventMeta::empty().with_id(stored.id),
                    };
                }

                loop {
                    let next = {
                        let mut buffer = listener.buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        buffer.pop()
                    };
                    match next {
                        Some(envelope) => {
                            if let Some(mark) = &high_water_mark {
                                if &envelope.id <= mark {
                                    continue;
                                }
                            }
                            high_water_mark = Some(envelope.id.clone());
                            yield Event {
                                channel: channel_for_stream.clone(),
                                payload: envelope.payload,
                                meta: EventMeta::empty().with_id(envelope.id),
                            };
                        }
                        None => {
                            listener.notify.notified().await;
                        }
                    }
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> SerializedPayload {
        SerializedPayload {
            json: value,
            meta_list: Vec::new(),
        }
    }

    #[tokio::test]
    async fn publish_then_subscribe_stream_delivers_replay_before_live() {
        let publisher = InMemoryPublisher::new();
        let channel = Channel::new("app", "orders");

        publisher.publish(&channel, payload(json!({"n": 1}))).await.unwrap();

        let mut stream = publisher
            .subscribe_stream(&channel, SubscribeOptions::default())
            .await
            .unwrap();

        let replayed = stream.next().await.unwrap();
        assert_eq!(replayed.payload.json, json!({"n": 1}));

        publisher.publish(&channel, payload(json!({"n": 2}))).await.unwrap();
        let live = stream.next().await.unwrap();
        assert_eq!(live.payload.json, json!({"n": 2}));
    }

    #[tokio::test]
    async fn resume_with_last_event_id_skips_already_seen_events() {
        let publisher = InMemoryPublisher::new();
        let channel = Channel::new("app", "orders");

        let first = publisher.publish(&channel, payload(json!({"n": 1}))).await.unwrap();
        publisher.publish(&channel, payload(json!({"n": 2}))).await.unwrap();

        let mut stream = publisher
            .subscribe_stream(
                &channel,
                SubscribeOptions {
                    last_event_id: Some(first),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let only = stream.next().await.unwrap();
        assert_eq!(only.payload.json, json!({"n": 2}));
    }

    #[tokio::test]
    async fn separate_channels_do_not_cross_deliver() {
        let publisher = InMemoryPublisher::new();
        let a = Channel::new("app", "a");
        let b = Channel::new("app", "b");

        let mut stream_a = publisher
            .subscribe_stream(&a, SubscribeOptions::default())
            .await
            .unwrap();

        publisher.publish(&b, payload(json!({"channel": "b"}))).await.unwrap();
        publisher.publish(&a, payload(json!({"channel": "a"}))).await.unwrap();

        let delivered = stream_a.next().await.unwrap();
        assert_eq!(delivered.payload.json, json!({"channel": "a"}));
    }

    #[tokio::test]
    async fn replay_and_concurrently_published_live_events_deliver_in_order_without_duplicates() {
        let publisher = InMemoryPublisher::new();
        let channel = Channel::new("app", "race");

        publisher.publish(&channel, payload(json!({"n": 1}))).await.unwrap();
        publisher.publish(&channel, payload(json!({"n": 2}))).await.unwrap();

        let mut stream = publisher
            .subscribe_stream(&channel, SubscribeOptions::default())
            .await
            .unwrap();

        for n in 3..=6 {
            publisher.publish(&channel, payload(json!({"n": n}))).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..6 {
            let event = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
                .await
                .expect("event within timeout")
                .expect("stream not closed");
            seen.push(event.payload.json["n"].as_i64().unwrap());
        }

        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn fixed_clock_is_reusable_from_core() {
        let clock = FixedClock::new(chrono::Utc::now());
        let t0 = clock.now();
        clock.advance(chrono::Duration::seconds(1));
        assert!(clock.now() > t0);
    }
}
