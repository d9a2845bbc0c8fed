//! Single-writer sqlite [`EventStore`] for the embedded/hibernation backend
//!
//! Schema: `events(channel TEXT NOT NULL, id INTEGER NOT NULL, payload TEXT
//! NOT NULL, stored_at INTEGER NOT NULL, PRIMARY KEY (channel, id))`, indexed
//! on `stored_at`. Ids are per-channel (each channel's next id is one past
//! its own current max, not a table-wide counter) and returned to callers as
//! text to tolerate values beyond the 53-bit safe integer range once they
//! cross the wire. Append failures trigger [`EmbeddedStore::reset_schema`],
//! which clears only the failing channel's rows and retries the append once;
//! a second failure propagates. Because ids and resets are scoped by
//! `channel`, one channel's history loss never touches another's.

use pubsub_core::channel::Channel;
use pubsub_core::event::{EventId, StoredEvent};
use pubsub_core::publisher::BoxFuture;
use pubsub_core::store::{EventStore, EventStoreError};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

impl From<sqlx::Error> for EventStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

/// sqlite-backed event store: one table per process, scoped to channel by a `channel` column.
pub struct EmbeddedStore {
    pool: SqlitePool,
    retention: Duration,
    last_swept: Mutex<HashMap<String, Instant>>,
}

impl EmbeddedStore {
    /// Wraps an already-connected sqlite pool, retaining events for `retention`.
    #[must_use]
    pub fn new(pool: SqlitePool, retention: Duration) -> Self {
        Self {
            pool,
            retention,
            last_swept: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the `events` table and its indexes if they do not already exist.
    ///
    /// # Errors
    ///
    /// Returns [`sqlx::Error`] if the schema cannot be created.
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS events (
                channel TEXT NOT NULL,
                id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                stored_at INTEGER NOT NULL,
                PRIMARY KEY (channel, id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_stored_at ON events(stored_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clears `channel`'s rows, discarding that channel's stored history.
    ///
    /// Invoked when an append to `channel` fails (disk full, id overflow);
    /// the caller retries the append once against the now-empty channel, so
    /// its ids restart from `1`. Other channels' rows are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`sqlx::Error`] if the rows cannot be deleted.
    pub async fn reset_schema(&self, channel: &Channel) -> Result<(), sqlx::Error> {
        tracing::warn!(channel = %channel.as_str(), "resetting embedded event store state for channel, its history will be lost");
        sqlx::query("DELETE FROM events WHERE channel = ?1")
            .bind(channel.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn needs_sweep(&self, channel: &str) -> bool {
        let mut last_swept = self.last_swept.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        last_swept.retain(|_, at| at.elapsed() < self.retention * 4);
        match last_swept.get(channel) {
            Some(at) if at.elapsed() < self.retention => false,
            _ => {
                last_swept.insert(channel.to_string(), Instant::now());
                true
            }
        }
    }

    /// Inserts one row for `channel` with the id one past that channel's
    /// current max, inside a transaction so concurrent appends to the same
    /// channel never race onto the same id.
    async fn append_once(
        &self,
        channel: &Channel,
        payload: &str,
        now: i64,
    ) -> Result<EventId, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS max_id FROM events WHERE channel = ?1")
            .bind(channel.as_str())
            .fetch_one(&mut *tx)
            .await?;
        let max_id: i64 = row.get("max_id");
        let next_id = max_id + 1;
        sqlx::query("INSERT INTO events (channel, id, payload, stored_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(channel.as_str())
            .bind(next_id)
            .bind(payload)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(EventId::from(next_id.to_string()))
    }

    /// Deletes every row belonging to `channel`.
    ///
    /// Intended for the hibernation backend's inactivity alarm when a given
    /// channel's durable-object instance has no live subscriber and no
    /// non-expired event remaining; other channels' rows are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`sqlx::Error`] if the rows cannot be deleted.
    pub async fn delete_all_state(&self, channel: &Channel) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM events WHERE channel = ?1")
            .bind(channel.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns `true` if `channel` has any event with `stored_at` not yet
    /// past the retention window.
    ///
    /// # Errors
    ///
    /// Returns [`sqlx::Error`] if the query fails.
    pub async fn has_non_expired_event(&self, channel: &Channel, now: i64) -> Result<bool, sqlx::Error> {
        let cutoff = now - i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX);
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events WHERE channel = ?1 AND stored_at >= ?2")
            .bind(channel.as_str())
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("n");
        Ok(count > 0)
    }
}

impl EventStore for EmbeddedStore {
    fn append<'a>(
        &'a self,
        channel: &'a Channel,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<EventId, EventStoreError>> {
        Box::pin(async move {
            let now = chrono::Utc::now().timestamp();
            match self.append_once(channel, payload, now).await {
                Ok(id) => Ok(id),
                Err(first_error) => {
                    tracing::error!(error = %first_error, channel = %channel.as_str(), "append failed, resetting channel state and retrying once");
                    self.reset_schema(channel).await.map_err(EventStoreError::from)?;
                    self.append_once(channel, payload, now)
                        .await
                        .map_err(EventStoreError::from)
                }
            }
        })
    }

    fn read_since<'a>(
        &'a self,
        channel: &'a Channel,
        since: Option<&'a EventId>,
    ) -> BoxFuture<'a, Result<Vec<StoredEvent>, EventStoreError>> {
        Box::pin(async move {
            let cursor: i64 = since
                .map(|id| id.as_str().parse().unwrap_or(0))
                .unwrap_or(0);
            let rows = sqlx::query(
                "SELECT id, payload, stored_at FROM events WHERE channel = ?1 AND id > ?2 ORDER BY id ASC",
            )
            .bind(channel.as_str())
            .bind(cursor)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::ReplayFailed(e.to_string()))?;

            Ok(rows
                .into_iter()
                .map(|row| {
                    let id: i64 = row.get("id");
                    StoredEvent {
                        id: EventId::from(id.to_string()),
                        payload: row.get("payload"),
                        stored_at: row.get("stored_at"),
                    }
                })
                .collect())
        })
    }

    fn sweep_retention<'a>(
        &'a self,
        channel: &'a Channel,
    ) -> BoxFuture<'a, Result<(), EventStoreError>> {
        Box::pin(async move {
            if !self.needs_sweep(channel.as_str()) {
                return Ok(());
            }
            let cutoff = chrono::Utc::now().timestamp()
                - i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX);
            sqlx::query("DELETE FROM events WHERE channel = ?1 AND stored_at < ?2")
                .bind(channel.as_str())
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(EventStoreError::from)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn in_memory_store() -> EmbeddedStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = EmbeddedStore::new(pool, Duration::from_secs(3600));
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids_per_channel() {
        let store = in_memory_store().await;
        let channel = Channel::new("app", "x");
        let id1 = store.append(&channel, "a").await.unwrap();
        let id2 = store.append(&channel, "b").await.unwrap();
        assert!(id1 < id2);
    }

    #[tokio::test]
    async fn read_since_filters_by_cursor_and_channel() {
        let store = in_memory_store().await;
        let a = Channel::new("app", "a");
        let b = Channel::new("app", "b");
        store.append(&a, "a1").await.unwrap();
        let cursor = store.append(&a, "a2").await.unwrap();
        store.append(&a, "a3").await.unwrap();
        store.append(&b, "b1").await.unwrap();

        let replayed = store.read_since(&a, Some(&cursor)).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].payload, "a3");
    }

    #[tokio::test]
    async fn reset_schema_allows_append_to_continue() {
        let store = in_memory_store().await;
        let channel = Channel::new("app", "x");
        store.append(&channel, "before").await.unwrap();
        store.reset_schema(&channel).await.unwrap();
        let id = store.append(&channel, "after").await.unwrap();
        assert_eq!(id.as_str(), "1", "ids restart from 1 after a schema reset");
    }

    #[tokio::test]
    async fn reset_schema_does_not_touch_other_channels() {
        let store = in_memory_store().await;
        let a = Channel::new("app", "a");
        let b = Channel::new("app", "b");
        store.append(&a, "a1").await.unwrap();
        store.append(&b, "b1").await.unwrap();
        store.append(&b, "b2").await.unwrap();

        store.reset_schema(&a).await.unwrap();

        let replayed_a = store.read_since(&a, None).await.unwrap();
        assert!(replayed_a.is_empty());
        let replayed_b = store.read_since(&b, None).await.unwrap();
        assert_eq!(replayed_b.len(), 2);
    }

    #[tokio::test]
    async fn has_non_expired_event_reflects_retention_window() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = EmbeddedStore::new(pool, Duration::from_secs(1));
        store.ensure_schema().await.unwrap();
        let channel = Channel::new("app", "x");
        store.append(&channel, "a").await.unwrap();
        assert!(store
            .has_non_expired_event(&channel, chrono::Utc::now().timestamp())
            .await
            .unwrap());
        assert!(!store
            .has_non_expired_event(&channel, chrono::Utc::now().timestamp() + 10)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn has_non_expired_event_is_scoped_per_channel() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = EmbeddedStore::new(pool, Duration::from_secs(3600));
        store.ensure_schema().await.unwrap();
        let a = Channel::new("app", "a");
        let b = Channel::new("app", "b");
        store.append(&a, "a1").await.unwrap();
        assert!(store
            .has_non_expired_event(&a, chrono::Utc::now().timestamp())
            .await
            .unwrap());
        assert!(!store
            .has_non_expired_event(&b, chrono::Utc::now().timestamp())
            .await
            .unwrap());
    }
}
