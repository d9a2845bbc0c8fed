//! # Pub/Sub Embedded Backend
//!
//! Single-instance durable event store and hibernation-aware fan-out, for
//! deployments with one active process per event namespace: a sqlite-backed
//! [`pubsub_core::EventStore`] ([`store::EmbeddedStore`]) and a
//! [`pubsub_core::Publisher`] that additionally fans out to attached,
//! token-gated hibernation sockets ([`hibernation::EmbeddedPublisher`]).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod hibernation;
pub mod store;

pub use hibernation::{EmbeddedPublisher, RevocationHook, TokenExpiry};
pub use store::EmbeddedStore;
