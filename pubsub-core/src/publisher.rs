//! The `Publisher` abstraction: backend-agnostic publish/subscribe contract.
//!
//! A `Publisher` is the single entry point a caller uses to publish events
//! onto a channel and to subscribe to one, either via a callback-style
//! listener or as an async stream. Concrete backends (Redis, the embedded
//! durable-object store) implement this trait; callers depend only on
//! `Arc<dyn Publisher>`.

use crate::channel::Channel;
use crate::event::{Event, EventId};
use crate::serializer::SerializedPayload;
use futures::stream::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A boxed future, used throughout this crate to keep trait methods dyn-compatible.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed stream of delivered events, used for the iterator subscription form.
pub type EventStream = Pin<Box<dyn Stream<Item = Event<SerializedPayload>> + Send>>;

/// Errors raised by a `Publisher` implementation.
#[derive(Error, Debug)]
pub enum PublisherError {
    /// The backend could not be reached to append or fan out an event.
    ///
    /// Surfaces to the `publish` caller only; unrelated subscriptions are left intact.
    #[error("publisher backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The payload could not be serialized for transport, or a received
    /// frame could not be deserialized. Receive-side failures are logged
    /// and the offending event dropped rather than killing the subscription.
    #[error("serialization failed: {0}")]
    Serialization(#[from] crate::serializer::SerializerError),

    /// The resume replay (`xread` or equivalent) failed. Logged; buffered live
    /// events still deliver and the dedup gate clears normally.
    #[error("resume fetch failed: {0}")]
    ResumeFetch(String),

    /// The channel name was rejected by the backend (e.g. empty).
    #[error("invalid channel: {0}")]
    InvalidChannel(String),
}

/// A single-threaded-per-subscription callback invoked for each delivered event.
pub type Listener = Box<dyn Fn(Event<SerializedPayload>) + Send + Sync>;

/// Options controlling how a subscription replays history and buffers live events.
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    /// Replay events with `id > last_event_id` before delivering live events.
    pub last_event_id: Option<EventId>,

    /// Cancellation signal for the subscription. Firing it rejects pending
    /// pullers with the signal's reason, unsubscribes in the background, and
    /// clears buffers.
    pub signal: Option<CancellationToken>,

    /// Bound on the in-memory ring buffer used by the iterator subscription form.
    ///
    /// `None` defaults to 100. `Some(0)` drops events when there is no
    /// consumer ready; `Some(1)` keeps only the latest event; larger values
    /// size the ring accordingly. Overflow always drops the oldest buffered
    /// item, never the live tail.
    pub max_buffered_events: Option<usize>,
}

/// Default ring buffer size for the iterator subscription form when unspecified.
pub const DEFAULT_MAX_BUFFERED_EVENTS: usize = 100;

impl SubscribeOptions {
    /// Returns the effective buffer bound, applying the default when unset.
    #[must_use]
    pub const fn effective_buffer_size(&self) -> usize {
        match self.max_buffered_events {
            Some(n) => n,
            None => DEFAULT_MAX_BUFFERED_EVENTS,
        }
    }
}

/// A handle returned from a callback-style subscription.
///
/// Owned by the caller; dropping it without calling [`Subscription::unsubscribe`]
/// leaves the listener registered. Release requires invoking `unsubscribe`
/// exactly once.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

impl Subscription {
    /// Builds a subscription handle wrapping the backend-specific teardown logic.
    #[must_use]
    pub fn new<F>(unsubscribe: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Releases the subscription. Idempotent: calling this more than once
    /// (or after the handle has already been consumed) is a no-op.
    pub async fn unsubscribe(mut self) {
        if let Some(teardown) = self.unsubscribe.take() {
            teardown().await;
        }
    }
}

/// Backend-agnostic publish/subscribe contract.
///
/// Implementations must be usable as `Arc<dyn Publisher>`, so all methods
/// return boxed futures rather than using `async fn` directly.
pub trait Publisher: Send + Sync {
    /// Publishes `payload` on `channel`, returning the id assigned by the backend.
    ///
    /// Fails only if the backend append/fan-out itself fails.
    fn publish<'a>(
        &'a self,
        channel: &'a Channel,
        payload: SerializedPayload,
    ) -> BoxFuture<'a, Result<EventId, PublisherError>>;

    /// Subscribes `listener` to `channel`. Invocation of `listener` is
    /// single-threaded per subscription.
    fn subscribe<'a>(
        &'a self,
        channel: &'a Channel,
        listener: Listener,
        options: SubscribeOptions,
    ) -> BoxFuture<'a, Result<Subscription, PublisherError>>;

    /// Subscribes to `channel`, returning an async sequence of delivered payloads.
    fn subscribe_stream<'a>(
        &'a self,
        channel: &'a Channel,
        options: SubscribeOptions,
    ) -> BoxFuture<'a, Result<EventStream, PublisherError>>;
}

/// Convenience alias for a shared, dynamically-dispatched publisher.
pub type SharedPublisher = Arc<dyn Publisher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_buffer_size_is_100() {
        let options = SubscribeOptions::default();
        assert_eq!(options.effective_buffer_size(), DEFAULT_MAX_BUFFERED_EVENTS);
    }

    #[test]
    fn explicit_buffer_size_overrides_default() {
        let options = SubscribeOptions {
            max_buffered_events: Some(0),
            ..Default::default()
        };
        assert_eq!(options.effective_buffer_size(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_invokes_teardown_exactly_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let subscription = Subscription::new(move || {
            let count = Arc::clone(&count_clone);
            Box::pin(async move {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
        });
        subscription.unsubscribe().await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
