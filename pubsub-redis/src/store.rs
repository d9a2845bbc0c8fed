//! Redis Streams-backed [`EventStore`]
//!
//! Each channel maps to a stream key `prefix || channel`. Every append
//! assigns a server-generated `time-seq` id via `XADD ... *`, trims the
//! stream to the retention window with `XTRIM ... MINID ~`, and refreshes
//! the key's TTL to `2 × retention` so abandoned channels self-expire.
//! Trim/expire only runs once per retention window per channel — tracked in
//! a small in-process map — to avoid paying the transaction cost on every
//! publish.

use pubsub_core::channel::Channel;
use pubsub_core::event::{EventId, StoredEvent};
use pubsub_core::publisher::BoxFuture;
use pubsub_core::store::{EventStore, EventStoreError};
use redis::AsyncCommands;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

impl From<redis::RedisError> for EventStoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

/// Default number of events Redis keeps when approximating a `MAXLEN` trim,
/// used only as a secondary safety net alongside the `MINID` retention trim.
const SAFETY_MAXLEN: usize = 1_000_000;

/// Redis Streams event store.
///
/// Owns a [`redis::Client`] and lazily opens multiplexed connections per
/// call (the `redis` crate's multiplexed connection is cheap to clone and
/// safe to share across tasks).
pub struct RedisStore {
    client: redis::Client,
    key_prefix: String,
    retention: Duration,
    last_swept: Mutex<HashMap<String, Instant>>,
}

impl RedisStore {
    /// Builds a store against `redis_url`, namespacing stream keys under `key_prefix`
    /// and retaining events for `retention`.
    ///
    /// # Errors
    ///
    /// Returns a [`redis::RedisError`] if `redis_url` cannot be parsed.
    pub fn new(
        redis_url: &str,
        key_prefix: impl Into<String>,
        retention: Duration,
    ) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            key_prefix: key_prefix.into(),
            retention,
            last_swept: Mutex::new(HashMap::new()),
        })
    }

    fn stream_key(&self, channel: &Channel) -> String {
        format!("{}{}", self.key_prefix, channel.as_str())
    }

    fn needs_sweep(&self, key: &str) -> bool {
        let mut last_swept = self.last_swept.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        // Cap the tracker's own memory by forgetting entries outside the retention window.
        last_swept.retain(|_, at| at.elapsed() < self.retention * 4);
        match last_swept.get(key) {
            Some(at) if at.elapsed() < self.retention => false,
            _ => {
                last_swept.insert(key.to_string(), Instant::now());
                true
            }
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, EventStoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(EventStoreError::from)
    }

    fn minid_for_retention(&self) -> String {
        let cutoff_ms = (chrono::Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or_default())
            .timestamp_millis()
            .max(0);
        format!("{cutoff_ms}-0")
    }
}

impl EventStore for RedisStore {
    fn append<'a>(
        &'a self,
        channel: &'a Channel,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<EventId, EventStoreError>> {
        Box::pin(async move {
            let key = self.stream_key(channel);
            let mut conn = self.connection().await?;

            let assigned_id: String = if self.needs_sweep(&key) {
                let minid = self.minid_for_retention();
                let ttl_seconds = (self.retention.as_secs() * 2).max(1);
                let (id, _trimmed, _expired): (String, i64, i64) = redis::pipe()
                    .atomic()
                    .cmd("XADD")
                    .arg(&key)
                    .arg("*")
                    .arg("payload")
                    .arg(payload)
                    .cmd("XTRIM")
                    .arg(&key)
                    .arg("MINID")
                    .arg("~")
                    .arg(&minid)
                    .cmd("EXPIRE")
                    .arg(&key)
                    .arg(ttl_seconds)
                    .query_async(&mut conn)
                    .await
                    .map_err(EventStoreError::from)?;
                id
            } else {
                conn.xadd_maxlen(
                    &key,
                    StreamMaxlen::Approx(SAFETY_MAXLEN),
                    "*",
                    &[("payload", payload)],
                )
                .await
                .map_err(EventStoreError::from)?
            };

            Ok(EventId::from(assigned_id))
        })
    }

    fn read_since<'a>(
        &'a self,
        channel: &'a Channel,
        since: Option<&'a EventId>,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>> {
        Box::pin(async move {
            let key = self.stream_key(channel);
            let mut conn = self.connection().await?;

            let cursor = since.map_or_else(|| "0".to_string(), |id| id.as_str().to_string());
            let reply: StreamReadReply = conn
                .xread_options(&[&key], &[&cursor], &StreamReadOptions::default())
                .await
                .map_err(|e| EventStoreError::ReplayFailed(e.to_string()))?;

            let mut events = Vec::new();
            for stream_key in reply.keys {
                for entry in stream_key.ids {
                    let payload: String = entry
                        .map
                        .get("payload")
                        .and_then(|v| redis::from_redis_value::<String>(v).ok())
                        .unwrap_or_default();
                    events.push(StoredEvent {
                        id: EventId::from(entry.id),
                        payload,
                        stored_at: chrono::Utc::now().timestamp(),
                    });
                }
            }
            Ok(events)
        })
    }

    fn sweep_retention<'a>(
        &'a self,
        channel: &'a Channel,
    ) -> BoxFuture<'a, Result<(), EventStoreError>> {
        Box::pin(async move {
            let key = self.stream_key(channel);
            if !self.needs_sweep(&key) {
                return Ok(());
            }
            let mut conn = self.connection().await?;
            let minid = self.minid_for_retention();
            let _: i64 = redis::cmd("XTRIM")
                .arg(&key)
                .arg("MINID")
                .arg("~")
                .arg(&minid)
                .query_async(&mut conn)
                .await
                .map_err(EventStoreError::from)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_key_joins_prefix_and_channel() {
        let store = RedisStore::new("redis://127.0.0.1/", "app:", Duration::from_secs(60)).unwrap();
        let channel = Channel::new("orders", "order-1");
        assert_eq!(store.stream_key(&channel), "app:orders:order-1");
    }

    #[test]
    fn sweep_tracker_throttles_within_retention_window() {
        let store = RedisStore::new("redis://127.0.0.1/", "app:", Duration::from_secs(3600)).unwrap();
        assert!(store.needs_sweep("k"));
        assert!(!store.needs_sweep("k"), "second check within the window should not need a sweep");
    }
}
