//! # Pub/Sub Core
//!
//! Backend-agnostic types and traits for a resumable event publish/subscribe
//! system: channel identity, event ids and metadata, the payload serializer,
//! the `Publisher` and `EventStore` traits concrete backends implement, and
//! the correlated peer-framing protocol used to carry requests and event
//! iterators across a duplex transport.
//!
//! ## Layout
//!
//! - [`channel`]: channel identity (`prefix || name`).
//! - [`event`]: event ids, metadata, and the stored-event shape.
//! - [`serializer`]: payload graph ↔ `(json, metaList)` mapping.
//! - [`publisher`]: the `Publisher` trait, subscriptions, and options.
//! - [`store`]: the `EventStore` trait used by resume-capable backends.
//! - [`peer`]: correlated request/response/event-iterator/abort framing.
//! - [`clock`]: a testable abstraction over wall-clock time.
//!
//! Concrete backends live in sibling crates: `pubsub-redis` (Redis Pub/Sub +
//! Streams) and `pubsub-embedded` (single-instance durable store and
//! hibernation-style fan-out). The client-side retry/resume engine lives in
//! `pubsub-client`.

pub mod channel;
pub mod clock;
pub mod event;
pub mod peer;
pub mod publisher;
pub mod serializer;
pub mod store;

pub use channel::Channel;
pub use clock::Clock;
pub use event::{Event, EventId, EventMeta, StoredEvent};
pub use publisher::{Publisher, PublisherError, Subscription, SubscribeOptions};
pub use store::{EventStore, EventStoreError};
