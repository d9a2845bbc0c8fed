//! Hibernation-aware [`Publisher`] for the single-instance durable-object backend
//!
//! Each attached websocket carries `{token_payload, hibernation_id}`. On
//! publish the event is appended to the embedded store, then fanned out to
//! every attached socket on the channel: a socket whose token has expired is
//! closed with code `4001`, one revoked by the optional hook is closed with
//! `4003`, otherwise the event is encoded with the socket's hibernation id
//! and sent. There is no dedicated sweeper — stale sockets are reaped lazily,
//! on the next fan-out that touches them.
//!
//! Local (non-websocket) subscribers are supported the same way the Redis
//! backend supports them: a bounded per-listener ring buffer drained by
//! [`Publisher::subscribe_stream`].

use axum::extract::ws::{Message, WebSocket};
use pubsub_core::channel::Channel;
use pubsub_core::event::{Event, EventId, EventMeta};
use pubsub_core::publisher::{
    BoxFuture, EventStream, Listener, Publisher, PublisherError, SubscribeOptions, Subscription,
};
use pubsub_core::serializer::SerializedPayload;
use pubsub_core::store::EventStore;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Websocket close code sent when a socket's token has expired.
pub const CLOSE_CODE_TOKEN_EXPIRED: u16 = 4001;

/// Websocket close code sent when a socket's token was revoked by the revocation hook.
pub const CLOSE_CODE_TOKEN_REVOKED: u16 = 4003;

/// Checks whether an attached socket's token payload has expired.
pub trait TokenExpiry: Send + Sync {
    /// Returns `true` if `payload` is no longer valid.
    fn is_expired(&self, payload: &Value) -> bool;
}

/// Optional hook consulted on every fan-out to reap revoked sockets without a sweeper.
pub trait RevocationHook: Send + Sync {
    /// Returns `true` if `payload` has been revoked and the socket should close.
    fn is_revoked(&self, payload: &Value) -> bool;
}

struct SocketAttachment {
    id: u64,
    token_payload: Value,
    hibernation_id: String,
    outbox: tokio::sync::mpsc::UnboundedSender<Message>,
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
type SocketRegistry = Arc<Mutex<HashMap<String, Vec<SocketAttachment>>>>;

/// Single-instance embedded [`Publisher`]: durable storage plus hibernation socket fan-out.
pub struct EmbeddedPublisher {
    store: Arc<dyn EventStore>,
    channels: ChannelRegistry,
    sockets: SocketRegistry,
    next_listener_id: AtomicU64,
    next_socket_id: AtomicU64,
    expiry: Arc<dyn TokenExpiry>,
    revocation: Option<Arc<dyn RevocationHook>>,
}

struct NeverExpires;

impl TokenExpiry for NeverExpires {
    fn is_expired(&self, _payload: &Value) -> bool {
        false
    }
}

impl EmbeddedPublisher {
    /// Builds a publisher over `store`, with a token-expiry check and an optional revocation hook.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, expiry: Arc<dyn TokenExpiry>) -> Self {
        Self {
            store,
            channels: Arc::new(Mutex::new(HashMap::new())),
            sockets: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
            next_socket_id: AtomicU64::new(0),
            expiry,
            revocation: None,
        }
    }

    /// Builds a publisher with no token-expiry enforcement, for contexts without hibernation sockets.
    #[must_use]
    pub fn without_expiry(store: Arc<dyn EventStore>) -> Self {
        Self::new(store, Arc::new(NeverExpires))
    }

    /// Installs a revocation hook, consulted on every fan-out alongside expiry.
    #[must_use]
    pub fn with_revocation_hook(mut self, hook: Arc<dyn RevocationHook>) -> Self {
        self.revocation = Some(hook);
        self
    }

    /// Accepts an upgraded websocket, replays events since `last_event_id`, then
    /// runs its send/receive loop until the connection closes.
    ///
    /// `hibernation_id` is the value the socket expects encoded in each delivered
    /// event (opaque to the publisher; passed through unchanged).
    pub async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        channel: Channel,
        token_payload: Value,
        hibernation_id: String,
        last_event_id: Option<EventId>,
    ) {
        use axum::extract::ws::CloseFrame;
        use futures::{SinkExt, StreamExt};

        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        if self.expiry.is_expired(&token_payload) {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_CODE_TOKEN_EXPIRED,
                    reason: "token expired".into(),
                })))
                .await;
            return;
        }

        let socket_id = self.next_socket_id.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut sockets = self.sockets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            sockets
                .entry(channel.as_str().to_string())
                .or_default()
                .push(SocketAttachment {
                    id: socket_id,
                    token_payload,
                    hibernation_id,
                    outbox: tx,
                });
        }

        match self.store.read_since(&channel, last_event_id.as_ref()).await {
            Ok(replayed) => {
                for stored in replayed {
                    let text = format!(r#"{{"id":"{}","payload":{}}}"#, stored.id, stored.payload);
                    if sink.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
            }
            Err(error) => {
                warn!(%error, "replay on hibernation socket attach failed");
            }
        }

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(Message::Close(frame)) => {
                            let _ = sink.send(Message::Close(frame)).await;
                            break;
                        }
                        Some(message) => {
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            debug!(%error, "hibernation socket receive error");
                            break;
                        }
                    }
                }
            }
        }

        let mut sockets = self.sockets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(list) = sockets.get_mut(channel.as_str()) {
            list.retain(|attachment| attachment.id != socket_id);
        }
    }

    fn register_listener(&self, channel: &Channel, max_buffered: usize) -> Arc<LocalListener> {
        let listener = Arc::new(LocalListener {
            id: self.next_listener_id.fetch_add(1, AtomicOrdering::Relaxed),
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


    fn dispatch_to_listeners(&self, channel: &Channel, id: &EventId, payload: &SerializedPayload) {
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

    fn dispatch_to_sockets(&self, channel: &Channel, id: &EventId, payload: &SerializedPayload) {
        let mut sockets = self.sockets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(attachments) = sockets.get_mut(channel.as_str()) else {
            return;
        };
        attachments.retain(|attachment| {
            if self.expiry.is_expired(&attachment.token_payload) {
                let _ = attachment.outbox.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: CLOSE_CODE_TOKEN_EXPIRED,
                    reason: "token expired".into(),
                })));
                return false;
            }
            if let Some(hook) = &self.revocation {
                if hook.is_revoked(&attachment.token_payload) {
                    let _ = attachment.outbox.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code: CLOSE_CODE_TOKEN_REVOKED,
                        reason: "token revoked".into(),
                    })));
                    return false;
                }
            }
            let text = format!(
                r#"{{"hibernationId":"{}","id":"{}","payload":{}}}"#,
                attachment.hibernation_id, id, payload.json
            );
            attachment.outbox.send(Message::Text(text)).is_ok()
        });
    }
}

struct ListenerGuard {
    channels: ChannelRegistry,
    channel: String,
    listener_id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(list) = channels.get_mut(&self.channel) {
            list.retain(|l| l.id != self.listener_id);
        }
    }
}

impl Publisher for EmbeddedPublisher {
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
            self.dispatch_to_listeners(channel, &id, &payload);
            self.dispatch_to_sockets(channel, &id, &payload);
            let _ = self.store.sweep_retention(channel).await;
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
