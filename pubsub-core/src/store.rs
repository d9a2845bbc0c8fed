//! The `EventStore` abstraction: durable append-and-replay for resume-capable backends.
//!
//! `EventStore` is narrower than [`crate::publisher::Publisher`] — it only
//! knows how to append a serialized payload to a channel's durable log and
//! read back everything after a given id. The Redis and embedded backends
//! each implement it and layer fan-out/subscription semantics on top in
//! their own `Publisher` implementation.

use crate::channel::Channel;
use crate::event::{EventId, StoredEvent};
use crate::publisher::BoxFuture;
use thiserror::Error;

/// Errors raised by an `EventStore` implementation.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// The backend could not be reached or the operation failed transiently.
    #[error("event store backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Append failed because the id space was exhausted; callers should
    /// retry once after the store resets its schema (embedded backend) or
    /// treat it as a backend failure (Redis backend, where overflow is not expected
    /// within a stream's practical lifetime).
    #[error("event id space exhausted for channel, schema reset required")]
    IdSpaceExhausted,

    /// A replay read failed. Logged by the caller; buffered live events still deliver.
    #[error("replay read failed: {0}")]
    ReplayFailed(String),
}

/// Durable append-and-replay log for a single resume-capable backend.
///
/// Implementations must be usable as `Arc<dyn EventStore>`, so methods
/// return boxed futures.
pub trait EventStore: Send + Sync {
    /// Appends `payload` to `channel`'s log, returning the newly assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::BackendUnavailable`] on transient failure or
    /// [`EventStoreError::IdSpaceExhausted`] if the id space must be reset first.
    fn append<'a>(
        &'a self,
        channel: &'a Channel,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<EventId, EventStoreError>>;

    /// Reads every stored event on `channel` with `id > since`, in ascending order.
    ///
    /// `since = None` reads from the beginning of the retained window.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::ReplayFailed`] if the read could not be completed.
    fn read_since<'a>(
        &'a self,
        channel: &'a Channel,
        since: Option<&'a EventId>,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>>;

    /// Removes stored events older than the backend's configured retention window.
    ///
    /// Implementations are expected to throttle this so it runs at most once
    /// per retention window per channel; callers may invoke it liberally.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::BackendUnavailable`] if the sweep could not run.
    fn sweep_retention<'a>(
        &'a self,
        channel: &'a Channel,
    ) -> BoxFuture<'a, Result<(), EventStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StoredEvent;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct InMemoryStore {
        channels: Mutex<BTreeMap<String, Vec<StoredEvent>>>,
    }

    impl EventStore for InMemoryStore {
        fn append<'a>(
            &'a self,
            channel: &'a Channel,
            payload: &'a str,
        ) -> BoxFuture<'a, Result<EventId, EventStoreError>> {
            Box::pin(async move {
                let mut channels = self.channels.lock().unwrap();
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
                let channels = self.channels.lock().unwrap();
                let entries = channels.get(channel.as_str()).cloned().unwrap_or_default();
                Ok(entries
                    .into_iter()
                    .filter(|e| since.as_ref().is_none_or(|s| &e.id > s))
                    .collect())
            })
        }

        fn sweep_retention<'a>(
            &'a self,
            _channel: &'a Channel,
        ) -> BoxFuture<'a, Result<(), EventStoreError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn append_assigns_strictly_increasing_ids() {
        let store = InMemoryStore {
            channels: Mutex::new(BTreeMap::new()),
        };
        let channel = Channel::new("app", "x");
        let id1 = store.append(&channel, "a").await.unwrap();
        let id2 = store.append(&channel, "b").await.unwrap();
        assert!(id1 < id2);
    }

    #[tokio::test]
    async fn read_since_excludes_up_to_and_including_cursor() {
        let store = InMemoryStore {
            channels: Mutex::new(BTreeMap::new()),
        };
        let channel = Channel::new("app", "x");
        store.append(&channel, "1").await.unwrap();
        let cursor = store.append(&channel, "2").await.unwrap();
        store.append(&channel, "3").await.unwrap();

        let replayed = store.read_since(&channel, Some(&cursor)).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].payload, "3");
    }
}
