//! # Pub/Sub Client
//!
//! Client-side retry/resume engine for the resumable event publish/subscribe
//! core: a generic retry state machine for RPC calls and event iterators
//! ([`retry`]), the durable-iterator websocket link ([`durable_iterator`]),
//! and the metric points both emit ([`metrics`]).
//!
//! [`resume_subscription`] is the convenience entry point most callers want:
//! it wraps [`pubsub_core::Publisher::subscribe_stream`] with the retry
//! engine so a subscriber automatically reconnects and resumes from the last
//! delivered event id on a transient failure.

pub mod durable_iterator;
pub mod metrics;
pub mod retry;

use pubsub_core::channel::Channel;
use pubsub_core::event::Event;
use pubsub_core::publisher::{Publisher, PublisherError, SubscribeOptions};
use pubsub_core::serializer::SerializedPayload;
use retry::{resume_event_stream, AttemptFailure, ResponseContext, RetryConfig, RetryError};
use std::sync::Arc;

/// Subscribes to `channel` on `publisher` with automatic retry and resume.
///
/// Equivalent to calling [`Publisher::subscribe_stream`] directly, except a
/// transient subscribe/replay failure drives the retry engine instead of
/// failing the whole subscription: the engine reruns the subscribe with
/// `last_event_id` set from the last delivered event, per the client retry
/// state machine.
pub fn resume_subscription(
    publisher: Arc<dyn Publisher>,
    channel: Channel,
    options: SubscribeOptions,
    retry_config: RetryConfig<PublisherError>,
) -> impl futures::Stream<Item = Result<Event<SerializedPayload>, RetryError<PublisherError>>> {
    resume_event_stream(retry_config, move |last_event_id| {
        let publisher = Arc::clone(&publisher);
        let channel = channel.clone();
        let mut options = options.clone();
        async move {
            if last_event_id.is_some() {
                options.last_event_id = last_event_id;
            }
            match publisher.subscribe_stream(&channel, options).await {
                Ok(stream) => {
                    use futures::StreamExt;
                    Ok(Box::pin(stream.map(Ok)) as retry::BoxEventStream<PublisherError>)
                }
                Err(error) => Err(AttemptFailure {
                    error,
                    context: ResponseContext::default(),
                }),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pubsub_core::event::EventMeta;
    use pubsub_testing::InMemoryPublisher;
    use serde_json::json;
    use std::time::Duration;

    fn payload(value: serde_json::Value) -> SerializedPayload {
        SerializedPayload {
            json: value,
            meta_list: Vec::new(),
        }
    }

    #[tokio::test]
    async fn resume_subscription_delivers_published_events_in_order() {
        let publisher: Arc<dyn Publisher> = Arc::new(InMemoryPublisher::new());
        let channel = Channel::new("test", "resume");

        let mut stream = Box::pin(resume_subscription(
            Arc::clone(&publisher),
            channel.clone(),
            SubscribeOptions::default(),
            RetryConfig::default(),
        ));

        publisher.publish(&channel, payload(json!({"order": 1}))).await.unwrap();
        publisher.publish(&channel, payload(json!({"order": 2}))).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("first event within timeout")
            .expect("stream not closed")
            .expect("delivered without retry error");
        let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("second event within timeout")
            .expect("stream not closed")
            .expect("delivered without retry error");

        assert_eq!(first.payload.json, json!({"order": 1}));
        assert_eq!(second.payload.json, json!({"order": 2}));
        let _ = EventMeta::empty();
    }
}
