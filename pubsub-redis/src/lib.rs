//! # Pub/Sub Redis Backend
//!
//! Redis-backed [`pubsub_core::EventStore`] and [`pubsub_core::Publisher`]
//! implementations: a channel's durable log lives in a Redis Stream, and
//! live fan-out rides Redis Pub/Sub. See [`store::RedisStore`] and
//! [`publisher::RedisPublisher`].

pub mod publisher;
pub mod store;

pub use publisher::RedisPublisher;
pub use store::RedisStore;
