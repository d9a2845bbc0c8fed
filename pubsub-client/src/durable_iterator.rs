//! Durable iterator link: a reconnecting websocket iterator backed by
//! short-lived tokens reissued through a snapshot-replayed RPC call 
//!
//! Given a one-shot call that returns a short-lived token plus a stable
//! websocket URL template, [`DurableIteratorLink`] produces a long-lived
//! event stream: the first connection uses the initial token, every
//! reconnect calls the captured snapshot (the original request, replayed
//! verbatim) to obtain a fresh token and embeds it in the URL under the
//! configured query parameter.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use pubsub_core::channel::Channel;
use pubsub_core::event::{Event, EventId};
use pubsub_core::peer::IteratorFrame;
use pubsub_core::serializer::SerializedPayload;
use tokio_tungstenite::tungstenite::Message;

use crate::retry::{resume_event_stream, AttemptFailure, BoxEventStream, ResponseContext, RetryConfig, RetryError};

/// A short-lived token plus the information needed to embed it in a connect URL.
#[derive(Clone, Debug)]
pub struct IssuedToken {
    /// The token value to embed in the websocket URL.
    pub token: String,
}

/// Error returned by the durable-iterator link: reissuing a token, opening
/// the socket, or reading from it once open.
#[derive(thiserror::Error, Debug)]
pub enum DurableIteratorError<E> {
    /// The snapshot-reissue call (the original RPC, replayed) failed.
    #[error("token reissue failed: {0}")]
    Reissue(E),
    /// The websocket handshake/connect failed.
    #[error("durable iterator connect failed: {0}")]
    Connect(String),
    /// The socket closed, or sent a frame the iterator protocol rejects,
    /// after a connection was already established.
    #[error("durable iterator stream failed: {0}")]
    Stream(String),
}

type ReissueFuture<'a, E> = Pin<Box<dyn Future<Output = Result<IssuedToken, E>> + Send + 'a>>;

/// Builds connect URLs for a durable iterator: the stable template plus a
/// fixed query parameter name under which the current token is embedded.
pub struct DurableIteratorLink<R, E> {
    url_template: String,
    token_param: String,
    reissue: R,
    _reissue_error: std::marker::PhantomData<fn() -> E>,
}

impl<R, E> DurableIteratorLink<R, E>
where
    R: for<'a> Fn() -> ReissueFuture<'a, E> + Send + Sync,
{
    /// Builds a link over `url_template` (containing no token placeholder itself;
    /// the token is appended as a query parameter), embedding tokens under
    /// `token_param`, and reissuing via `reissue` on every reconnect after the first.
    pub fn new(url_template: impl Into<String>, token_param: impl Into<String>, reissue: R) -> Self {
        Self {
            url_template: url_template.into(),
            token_param: token_param.into(),
            reissue,
            _reissue_error: std::marker::PhantomData,
        }
    }

    /// Builds the connect URL for the first connection, given the initial token
    /// obtained by the one-shot call that created this link.
    #[must_use]
    pub fn initial_url(&self, initial: &IssuedToken) -> String {
        self.embed(initial)
    }

    /// Reissues a fresh token via the snapshot-replayed call and builds the
    /// next connect URL.
    ///
    /// # Errors
    ///
    /// Returns [`DurableIteratorError::Reissue`] if the underlying call fails.
    pub async fn reconnect_url(&self) -> Result<String, DurableIteratorError<E>> {
        let token = (self.reissue)().await.map_err(DurableIteratorError::Reissue)?;
        Ok(self.embed(&token))
    }

    fn embed(&self, token: &IssuedToken) -> String {
        // Tokens are short-lived bearer credentials (JWTs and similar), which
        // are URL-safe base64 by construction; no percent-encoding needed.
        let separator = if self.url_template.contains('?') { '&' } else { '?' };
        format!("{}{separator}{}={}", self.url_template, self.token_param, token.token)
    }
}

impl<R, E> DurableIteratorLink<R, E>
where
    R: for<'a> Fn() -> ReissueFuture<'a, E> + Send + Sync + 'static,
    E: Send + 'static,
{
    /// Connects a long-lived, reconnecting event stream for `channel`.
    ///
    /// The first connection embeds `initial`'s token; every later attempt is
    /// driven by the retry engine, which calls back into [`reconnect_url`]
    /// for a freshly reissued token before retrying. A socket that closes, or
    /// a frame the iterator protocol rejects, surfaces as a stream item error
    /// that the retry engine treats the same as any other attempt failure.
    ///
    /// [`reconnect_url`]: DurableIteratorLink::reconnect_url
    pub fn connect(
        self: Arc<Self>,
        channel: Channel,
        initial: IssuedToken,
        retry_config: RetryConfig<DurableIteratorError<E>>,
    ) -> impl Stream<Item = Result<Event<SerializedPayload>, RetryError<DurableIteratorError<E>>>> {
        let mut next_url = Some(self.initial_url(&initial));
        resume_event_stream(retry_config, move |_last_event_id| {
            let link = Arc::clone(&self);
            let channel = channel.clone();
            let pending_url = next_url.take();
            async move {
                let url = match pending_url {
                    Some(url) => url,
                    None => link.reconnect_url().await.map_err(|error| AttemptFailure {
                        error,
                        context: ResponseContext::default(),
                    })?,
                };
                connect_once(url, channel).await
            }
        })
    }
}

/// Opens one websocket connection to `url` and decodes its frames into an
/// event stream, scoped to `channel`.
///
/// The returned stream ends cleanly on a `Done` frame; any other way the
/// connection stops (a transport error, a `Error` frame, or the socket
/// closing without a `Done`) is surfaced as one `Err` item before the stream
/// ends, so [`resume_event_stream`] treats it as a retryable failure.
async fn connect_once<E: Send + 'static>(
    url: String,
    channel: Channel,
) -> Result<BoxEventStream<DurableIteratorError<E>>, AttemptFailure<DurableIteratorError<E>>> {
    let (socket, _response) = tokio_tungstenite::connect_async(&url).await.map_err(|err| AttemptFailure {
        error: DurableIteratorError::Connect(err.to_string()),
        context: ResponseContext::default(),
    })?;

    let stream = async_stream::stream! {
        let mut socket = socket;
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<IteratorFrame>(&text) {
                        Ok(IteratorFrame::Message { data, meta }) => {
                            yield Ok(iterator_message_to_event(&channel, data, meta));
                        }
                        Ok(IteratorFrame::Done { .. }) => return,
                        Ok(IteratorFrame::Error { message, .. }) => {
                            yield Err(DurableIteratorError::Stream(message));
                            return;
                        }
                        Err(decode_error) => {
                            yield Err(DurableIteratorError::Stream(decode_error.to_string()));
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map_or_else(String::new, |f| f.reason.to_string());
                    yield Err(DurableIteratorError::Stream(format!("socket closed: {reason}")));
                    return;
                }
                Some(Ok(_ping_pong_or_binary)) => continue,
                Some(Err(transport_error)) => {
                    yield Err(DurableIteratorError::Stream(transport_error.to_string()));
                    return;
                }
                None => {
                    yield Err(DurableIteratorError::Stream("connection closed without a done frame".to_string()));
                    return;
                }
            }
        }
    };

    Ok(Box::pin(stream))
}

fn iterator_message_to_event(
    channel: &Channel,
    data: serde_json::Value,
    meta: Option<pubsub_core::peer::IteratorMeta>,
) -> Event<SerializedPayload> {
    let mut event = Event::new(
        channel.clone(),
        SerializedPayload {
            json: data,
            meta_list: Vec::new(),
        },
    );
    if let Some(meta) = meta {
        event.meta.id = meta.id.map(EventId::from);
        event.meta.retry = meta.retry;
    }
    event
}

/// Header name used by the durable-iterator response interceptor to mark a
/// response as eligible for upgrade into a durable iterator. Only responses
/// carrying this header (with any non-empty value) are upgraded; others
/// pass through unchanged.
pub const DURABLE_ITERATOR_MARKER_HEADER: &str = "x-durable-iterator";

/// Returns `true` if `headers` marks its response as a durable-iterator response.
#[must_use]
pub fn is_durable_iterator_response<'a>(
    mut headers: impl Iterator<Item = (&'a str, &'a str)>,
) -> bool {
    headers.any(|(name, value)| name.eq_ignore_ascii_case(DURABLE_ITERATOR_MARKER_HEADER) && !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_url_appends_token_with_question_mark_when_template_has_no_query() {
        let link = DurableIteratorLink::new("wss://example/stream", "token", || {
            Box::pin(async { Ok::<_, String>(IssuedToken { token: "unused".into() }) })
        });
        let url = link.initial_url(&IssuedToken { token: "abc".into() });
        assert_eq!(url, "wss://example/stream?token=abc");
    }

    #[test]
    fn initial_url_appends_token_with_ampersand_when_template_already_has_a_query() {
        let link = DurableIteratorLink::new("wss://example/stream?room=1", "token", || {
            Box::pin(async { Ok::<_, String>(IssuedToken { token: "unused".into() }) })
        });
        let url = link.initial_url(&IssuedToken { token: "abc".into() });
        assert_eq!(url, "wss://example/stream?room=1&token=abc");
    }

    #[tokio::test]
    async fn reconnect_url_uses_the_reissued_token() {
        let link = DurableIteratorLink::new("wss://example/stream", "token", || {
            Box::pin(async { Ok::<_, String>(IssuedToken { token: "fresh".into() }) })
        });
        let url = link.reconnect_url().await.unwrap();
        assert_eq!(url, "wss://example/stream?token=fresh");
    }

    #[tokio::test]
    async fn reconnect_url_propagates_reissue_failure() {
        let link = DurableIteratorLink::new("wss://example/stream", "token", || {
            Box::pin(async { Err::<IssuedToken, _>("reissue failed".to_string()) })
        });
        let result = link.reconnect_url().await;
        assert!(matches!(result, Err(DurableIteratorError::Reissue(_))));
    }

    #[test]
    fn marker_header_detection_is_case_insensitive_and_ignores_other_headers() {
        assert!(is_durable_iterator_response(
            [("content-type", "application/json"), ("X-Durable-Iterator", "1")].into_iter()
        ));
        assert!(!is_durable_iterator_response(
            [("content-type", "application/json")].into_iter()
        ));
    }

    use futures::SinkExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn local_listener() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, format!("ws://{addr}"))
    }

    #[tokio::test]
    async fn connect_once_streams_messages_until_done_frame() {
        let (listener, url) = local_listener().await;

        tokio::spawn(async move {
            let (raw, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(raw).await.unwrap();
            socket
                .send(Message::Text(r#"{"event":"message","data":{"n":1},"meta":null}"#.into()))
                .await
                .unwrap();
            socket
                .send(Message::Text(r#"{"event":"done","data":null}"#.into()))
                .await
                .unwrap();
        });

        let channel = Channel::new("app", "durable");
        let stream = connect_once::<String>(url, channel).await.unwrap();
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 1);
        let event = items.into_iter().next().unwrap().unwrap();
        assert_eq!(event.payload.json, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn connect_once_surfaces_error_frame_as_err_item() {
        let (listener, url) = local_listener().await;

        tokio::spawn(async move {
            let (raw, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(raw).await.unwrap();
            socket
                .send(Message::Text(r#"{"event":"error","meta":null,"message":"upstream failed"}"#.into()))
                .await
                .unwrap();
        });

        let channel = Channel::new("app", "durable");
        let stream = connect_once::<String>(url, channel).await.unwrap();
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(DurableIteratorError::Stream(message)) => assert_eq!(message, "upstream failed"),
            other => panic!("expected a stream error item, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_once_fails_when_nothing_is_listening() {
        let result = connect_once::<String>("ws://127.0.0.1:1".to_string(), Channel::new("app", "x")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn link_connect_reconnects_through_the_retry_engine_after_a_dropped_socket() {
        let (listener, url) = local_listener().await;

        tokio::spawn(async move {
            // First connection: one message, then the socket drops without a `done` frame.
            let (raw, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(raw).await.unwrap();
            socket
                .send(Message::Text(r#"{"event":"message","data":1,"meta":null}"#.into()))
                .await
                .unwrap();
            drop(socket);

            // Second connection, after reissue: one message, then a clean `done`.
            let (raw, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(raw).await.unwrap();
            socket
                .send(Message::Text(r#"{"event":"message","data":2,"meta":null}"#.into()))
                .await
                .unwrap();
            socket
                .send(Message::Text(r#"{"event":"done","data":null}"#.into()))
                .await
                .unwrap();
        });

        let reissues = Arc::new(AtomicU32::new(0));
        let reissues_clone = Arc::clone(&reissues);
        let link = Arc::new(DurableIteratorLink::new(url, "token", move || {
            let reissues = Arc::clone(&reissues_clone);
            Box::pin(async move {
                reissues.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(IssuedToken { token: "fresh".into() })
            })
        }));

        let retry_config = RetryConfig {
            max_attempts: 3,
            retry_timeout: Duration::from_secs(5),
            retry_delay: Box::new(|_attempt, _ctx| Duration::from_millis(1)),
            should_retry: Box::new(|_| true),
            on_retry: Box::new(|_| {}),
            signal: None,
        };

        let channel = Channel::new("app", "durable");
        let stream = link.connect(channel, IssuedToken { token: "initial".into() }, retry_config);
        let items = tokio::time::timeout(Duration::from_secs(2), stream.collect::<Vec<_>>())
            .await
            .expect("stream completes within timeout");

        let values: Vec<_> = items.into_iter().map(|item| item.unwrap()).collect();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].payload.json, serde_json::json!(1));
        assert_eq!(values[1].payload.json, serde_json::json!(2));
        assert_eq!(reissues.load(Ordering::SeqCst), 1, "exactly one reissue for the one reconnect");
    }
}
