//! Event identity and the event/meta/stored-event data model.
//!
//! Events are the unit of publish/subscribe traffic: a `(channel, payload,
//! meta)` triple, where `meta` carries an opaque, monotone-per-channel id
//! assigned by the event store at append time. Any client-supplied id on
//! publish is overwritten — the store is the sole id authority.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// An opaque, monotone-per-channel, lexicographically comparable event identifier.
///
/// `EventId` is deliberately string-typed: the Redis backend produces
/// `time-seq` pairs (e.g. `"1700000000000-3"`) while the embedded backend
/// produces stringified auto-increment integers (e.g. `"42"`). Both are
/// compared the same way: split on `-`, compare each numeric segment as an
/// arbitrary-precision unsigned integer (by digit count first, then
/// lexicographically), and let the first non-equal segment decide, with a
/// missing trailing segment treated as smaller. This gives a strict total
/// order over any id shape the two backends emit and matches the `time-seq`
/// comparison rule: time dominates, sequence breaks ties.
///
/// # Examples
///
/// ```
/// use pubsub_core::event::EventId;
///
/// let a = EventId::from("9");
/// let b = EventId::from("10");
/// assert!(a < b, "numeric comparison, not lexicographic byte comparison");
///
/// let c = EventId::from("1700000000000-2");
/// let d = EventId::from("1700000000000-10");
/// assert!(c < d);
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    /// Wraps a raw id string as produced by an event store backend.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id, returning the raw string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('-')
    }
}

fn compare_numeric_segment(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

impl Ord for EventId {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut a = self.segments();
        let mut b = other.segments();
        loop {
            match (a.next(), b.next()) {
                (Some(x), Some(y)) => {
                    let ord = compare_numeric_segment(x, y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
                (None, None) => return Ordering::Equal,
            }
        }
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Application-level and store-assigned metadata carried alongside a payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventMeta {
    /// The id assigned by the event store at append time. `None` before append.
    pub id: Option<EventId>,

    /// Optional client retry hint, in milliseconds, surfaced to resuming subscribers.
    pub retry: Option<u64>,
}

impl EventMeta {
    /// An empty metadata value, as produced before a store assigns an id.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            id: None,
            retry: None,
        }
    }

    /// Returns a copy of this metadata with `id` set.
    #[must_use]
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// Returns a copy of this metadata with `retry` set.
    #[must_use]
    pub const fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }
}

/// The `(channel, payload, meta)` triple delivered to subscribers.
///
/// `Payload` is generic: backends work over an already-serialized
/// [`crate::serializer::SerializedPayload`] on the wire, while in-process
/// callers (tests, the embedded backend's direct dispatch path) may work
/// over a typed value.
#[derive(Clone, Debug)]
pub struct Event<Payload> {
    /// The channel this event was published on.
    pub channel: crate::channel::Channel,

    /// The event payload.
    pub payload: Payload,

    /// Event metadata, including the store-assigned id.
    pub meta: EventMeta,
}

impl<Payload> Event<Payload> {
    /// Builds an event with empty metadata, prior to store assignment.
    #[must_use]
    pub const fn new(channel: crate::channel::Channel, payload: Payload) -> Self {
        Self {
            channel,
            payload,
            meta: EventMeta::empty(),
        }
    }

    /// Returns the event's id, if one has been assigned.
    #[must_use]
    pub fn id(&self) -> Option<&EventId> {
        self.meta.id.as_ref()
    }
}

/// A durably stored event, as persisted by a resume-capable event store.
///
/// Invariant: ids within a channel are strictly increasing in insertion
/// order, and `stored_at` is monotone non-decreasing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEvent {
    /// The store-assigned id.
    pub id: EventId,

    /// The serialized payload, as stored (store implementations are payload-format-agnostic).
    pub payload: String,

    /// Unix-seconds timestamp at which the event was stored.
    pub stored_at: i64,
}
