//! Redis Publisher Backend.: combines Pub/Sub for low-latency
//! fan-out with the Streams-backed [`crate::store::RedisStore`] for resume.
//!
//! Two connections are used: a commander, reused across short-lived publish
//! commands, and a dedicated listener connection that stays in subscribe
//! mode for the lifetime of the publisher. Rather than issuing a Redis
//! `SUBSCRIBE`/`UNSUBSCRIBE` per channel (which would require tearing down
//! and rebuilding the listener's message stream on every local
//! subscribe/unsubscribe — awkward with the client library's borrow shape,
//! and unnecessary here), the listener pattern-subscribes once to the whole
//! key-prefix namespace, exactly as the pack's Redis Pub/Sub cluster
//! implementation subscribes to a small, fixed set of wildcard patterns
//! rather than per-room channels. A single "on message" handler dispatches
//! by the message's literal channel name to the set of locally registered
//! listeners for that channel.

use crate::store::RedisStore;
use futures::stream::StreamExt;
use pubsub_core::channel::Channel;
use pubsub_core::event::{Event, EventId, EventMeta};
use pubsub_core::publisher::{
    BoxFuture, EventStream, Listener, Publisher, PublisherError, SubscribeOptions, Subscription,
};
use pubsub_core::serializer::SerializedPayload;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

impl From<redis::RedisError> for PublisherError {
    fn from(err: redis::RedisError) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

/// Wire envelope published on the Redis Pub/Sub channel alongside a stream append.
///
/// Embeds the stream id assigned by the `XADD` so live subscribers observe
/// the same id a replay would have produced for the same event.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Envelope {
    id: String,
    payload: String,
    retry: Option<u64>,
}

/// A bounded ring buffer with drop-oldest overflow, backing one local listener.
///
/// `capacity = 0` delivers to a parked consumer (rendezvous) and drops
/// otherwise — there is no buffering without an active consumer;
/// `capacity = usize::MAX` behaves as unbounded.
struct RingBuffer {
    capacity: usize,
    items: VecDeque<Envelope>,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::new(),
        }
    }

    /// `consumer_waiting` is only consulted for `capacity == 0`: the item is
    /// held for the parked consumer's immediate pop rather than dropped.
    fn push(&mut self, item: Envelope, consumer_waiting: bool) {
        if self.capacity == 0 {
            if consumer_waiting {
                self.items.push_back(item);
            }
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    fn pop(&mut self) -> Option<Envelope> {
        self.items.pop_front()
    }
}

struct LocalListener {
    id: u64,
    buffer: Arc<Mutex<RingBuffer>>,
    notify: Arc<Notify>,
    /// Set while the subscriber's stream task is parked waiting for the next
    /// item, so a zero-capacity buffer can still hand off a live event.
    waiting: Arc<AtomicBool>,
}

type ChannelRegistry = Arc<Mutex<HashMap<String, Vec<LocalListener>>>>;

/// Redis-backed `Publisher`, combining Pub/Sub fan-out with Streams-backed resume.
pub struct RedisPublisher {
    store: Arc<RedisStore>,
    client: redis::Client,
    key_prefix: String,
    commander: Mutex<Option<redis::aio::MultiplexedConnection>>,
    channels: ChannelRegistry,
    next_listener_id: AtomicU64,
    listener_shutdown: CancellationToken,
}

impl RedisPublisher {
    /// Builds a publisher over `redis_url`, reusing `store` for append/replay.
    ///
    /// Spawns the single background dispatch task that stays subscribed to the
    /// whole `key_prefix` namespace for the lifetime of the returned publisher.
    ///
    /// # Errors
    ///
    /// Returns a [`redis::RedisError`] if `redis_url` cannot be parsed.
    pub fn new(
        redis_url: &str,
        store: Arc<RedisStore>,
        key_prefix: impl Into<String>,
    ) -> Result<Arc<Self>, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let publisher = Arc::new(Self {
            store,
            client,
            key_prefix: key_prefix.into(),
            commander: Mutex::new(None),
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
            listener_shutdown: CancellationToken::new(),
        });
        publisher.clone().spawn_dispatch_loop();
        Ok(publisher)
    }

    fn stream_key(&self, channel: &Channel) -> String {
        format!("{}{}", self.key_prefix, channel.as_str())
    }

    fn pattern(&self) -> String {
        format!("{}*", self.key_prefix)
    }

    fn spawn_dispatch_loop(self: Arc<Self>) {
        let shutdown = self.listener_shutdown.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                match self.client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.psubscribe(self.pattern()).await {
                            error!(error = %e, "failed to pattern-subscribe to Redis pub/sub namespace");
                        } else {
                            backoff = Duration::from_secs(1);
                            let mut messages = pubsub.on_message();
                            loop {
                                tokio::select! {
                                    () = shutdown.cancelled() => return,
                                    msg = messages.next() => {
                                        match msg {
                                            Some(msg) => self.dispatch_message(&msg),
                                            None => break,
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to open Redis pub/sub connection, retrying");
                    }
                }
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        });
    }

    fn dispatch_message(&self, msg: &redis::Msg) {
        let channel_key: String = msg.get_channel_name().to_string();
        let Ok(envelope) = msg.get_payload::<String>().map(|s| serde_json::from_str::<Envelope>(&s)) else {
            warn!(channel = %channel_key, "dropping unreadable Redis pub/sub payload");
            return;
        };
        let Ok(envelope) = envelope else {
            warn!(channel = %channel_key, "dropping envelope that failed to deserialize");
            return;
        };

        let channels = self.channels.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(listeners) = channels.get(&channel_key) {
            for listener in listeners {
                let waiting = listener.waiting.load(Ordering::Acquire);
                let mut buffer = listener.buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                buffer.push(envelope.clone(), waiting);
                drop(buffer);
                listener.notify.notify_one();
            }
        }
    }

    async fn commander_connection(
        &self,
    ) -> Result<redis::aio::MultiplexedConnection, PublisherError> {
        let mut guard = self.commander.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(PublisherError::from)?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn register_listener(
        &self,
        channel_key: &str,
        capacity: usize,
    ) -> (u64, Arc<Mutex<RingBuffer>>, Arc<Notify>, Arc<AtomicBool>) {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let buffer = Arc::new(Mutex::new(RingBuffer::new(capacity)));
        let notify = Arc::new(Notify::new());
        let waiting = Arc::new(AtomicBool::new(false));
        let mut channels = self.channels.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .entry(channel_key.to_string())
            .or_default()
            .push(LocalListener {
                id,
                buffer: Arc::clone(&buffer),
                notify: Arc::clone(&notify),
                waiting: Arc::clone(&waiting),
            });
        (id, buffer, notify, waiting)
    }

    fn unregister_listener(&self, channel_key: &str, id: u64) {
        let mut channels = self.channels.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(listeners) = channels.get_mut(channel_key) {
            listeners.retain(|l| l.id != id);
            if listeners.is_empty() {
                channels.remove(channel_key);
                debug!(channel = %channel_key, "last local listener detached, dropped channel bookkeeping");
            }
        }
    }
}

impl Publisher for RedisPublisher {
    fn publish<'a>(
        &'a self,
        channel: &'a Channel,
        payload: SerializedPayload,
    ) -> BoxFuture<'a, Result<EventId, PublisherError>> {
        Box::pin(async move {
            let payload_json = serde_json::to_string(&payload)?;
            let id = self
                .store
                .append(channel, &payload_json)
                .await
                .map_err(|e| PublisherError::BackendUnavailable(e.to_string()))?;

            let envelope = Envelope {
                id: id.as_str().to_string(),
                payload: payload_json,
                retry: None,
            };
            let encoded = serde_json::to_string(&envelope)?;
            let key = self.stream_key(channel);
            let mut conn = self.commander_connection().await?;
            let _: i64 = redis::AsyncCommands::publish(&mut conn, &key, encoded)
                .await
                .map_err(PublisherError::from)?;

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
            let channel = channel.clone();
            let task = tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    listener(event);
                }
                let _ = channel; // kept for potential diagnostics, not otherwise needed
            });
            Ok(Subscription::new(move || {
                Box::pin(async move {
                    task.abort();
                })
            }))
        })
    }

    fn subscribe_stream<'a>(
        &'a self,
        channel: &'a Channel,
        options: SubscribeOptions,
    ) -> BoxFuture<'a, Result<EventStream, PublisherError>> {
        Box::pin(async move {
            let key = self.stream_key(channel);
            let capacity = options.effective_buffer_size();
            let (listener_id, buffer, notify, waiting) = self.register_listener(&key, capacity);
            let channels = Arc::clone(&self.channels);
            let key_for_cleanup = key.clone();

            let replayed = self
                .store
                .read_since(channel, options.last_event_id.as_ref())
                .await
                .map_err(|e| PublisherError::ResumeFetch(e.to_string()))?;

            let high_water_mark = replayed.last().map(|e| e.id.clone());
            let channel = channel.clone();
            let signal = options.signal.clone();

            let s = async_stream::stream! {
                for stored in replayed {
                    let payload: SerializedPayload = match serde_json::from_str(&stored.payload) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable replayed event");
                            continue;
                        }
                    };
                    yield Event {
                        channel: channel.clone(),
                        payload,
                        meta: EventMeta::empty().with_id(stored.id),
                    };
                }

                let mut gate = high_water_mark;
                loop {
                    if let Some(token) = &signal {
                        if token.is_cancelled() {
                            break;
                        }
                    }

                    let next = {
                        let mut buf = buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        buf.pop()
                    };

                    let envelope = match next {
                        Some(envelope) => envelope,
                        None => {
                            // Mark this subscriber as parked so a zero-capacity
                            // buffer can still hand off the next published event
                            // instead of dropping it, then re-check in case a
                            // push raced the flag.
                            waiting.store(true, Ordering::Release);
                            let requeued = {
                                let mut buf = buffer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                                buf.pop()
                            };
                            match requeued {
                                Some(envelope) => {
                                    waiting.store(false, Ordering::Release);
                                    envelope
                                }
                                None => {
                                    if let Some(token) = &signal {
                                        tokio::select! {
                                            () = token.cancelled() => {
                                                waiting.store(false, Ordering::Release);
                                                break;
                                            }
                                            () = notify.notified() => {}
                                        }
                                    } else {
                                        notify.notified().await;
                                    }
                                    waiting.store(false, Ordering::Release);
                                    continue;
                                }
                            }
                        }
                    };

                    let id = EventId::from(envelope.id.clone());
                    if let Some(gate_id) = &gate {
                        if &id <= gate_id {
                            continue;
                        }
                    }
                    gate = None;

                    let payload: SerializedPayload = match serde_json::from_str(&envelope.payload) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable live event");
                            continue;
                        }
                    };
                    yield Event {
                        channel: channel.clone(),
                        payload,
                        meta: EventMeta::empty().with_id(id).with_retry(envelope.retry.unwrap_or(0)),
                    };
                }

                let mut registry = channels.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(listeners) = registry.get_mut(&key_for_cleanup) {
                    listeners.retain(|l| l.id != listener_id);
                    if listeners.is_empty() {
                        registry.remove(&key_for_cleanup);
                    }
                }
            };

            Ok(Box::pin(s) as EventStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest_on_overflow() {
        let mut ring = RingBuffer::new(2);
        ring.push(Envelope { id: "1".into(), payload: String::new(), retry: None }, false);
        ring.push(Envelope { id: "2".into(), payload: String::new(), retry: None }, false);
        ring.push(Envelope { id: "3".into(), payload: String::new(), retry: None }, false);
        assert_eq!(ring.pop().unwrap().id, "2");
        assert_eq!(ring.pop().unwrap().id, "3");
        assert!(ring.pop().is_none());
    }

    #[test]
    fn ring_buffer_zero_capacity_drops_without_waiting_consumer() {
        let mut ring = RingBuffer::new(0);
        ring.push(Envelope { id: "1".into(), payload: String::new(), retry: None }, false);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn ring_buffer_zero_capacity_delivers_to_waiting_consumer() {
        let mut ring = RingBuffer::new(0);
        ring.push(Envelope { id: "1".into(), payload: String::new(), retry: None }, true);
        assert_eq!(ring.pop().unwrap().id, "1");
        assert!(ring.pop().is_none());
    }
}
