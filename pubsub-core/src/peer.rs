//! Peer framing: correlated request/response/event-iterator/abort frames
//! carried over an ordered duplex channel (message port, websocket, paired workers).
//!
//! Each frame carries a correlation id, a kind tag, and a payload. Within a
//! single correlation id, frames are processed in receive order; across ids
//! no ordering is assumed. The peer keeps only `O(outstanding-requests)`
//! state: one slot per correlation id currently awaiting a response or
//! draining an iterator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Frame kind tag, as carried in the text framing's `tag` segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// A request initiating a correlated exchange.
    Request,
    /// The single terminal response to a request.
    Response,
    /// One item of a streamed event-iterator response.
    EventIterator,
    /// Cancels the exchange identified by the correlation id.
    AbortSignal,
}

impl FrameKind {
    /// Returns the short tag used in the text framing (`req`, `res`, `evt`, `abrt`).
    #[must_use]
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Request => "req",
            Self::Response => "res",
            Self::EventIterator => "evt",
            Self::AbortSignal => "abrt",
        }
    }

    /// Parses a text-framing tag back into a `FrameKind`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "req" => Some(Self::Request),
            "res" => Some(Self::Response),
            "evt" => Some(Self::EventIterator),
            "abrt" => Some(Self::AbortSignal),
            _ => None,
        }
    }
}

/// A correlation id, unique per outstanding exchange on one peer.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One frame of the peer protocol: correlation id, kind, and a JSON payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    /// The correlation id this frame belongs to.
    pub id: CorrelationId,
    /// The frame kind.
    pub kind: FrameKind,
    /// The frame's JSON payload.
    pub payload: Value,
}

/// Errors raised while framing or unframing peer messages.
#[derive(Error, Debug)]
pub enum PeerError {
    /// The text framing (`id|tag|json`) was malformed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The payload could not be decoded as JSON.
    #[error("invalid frame payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// A send over the underlying transport failed; any in-flight iterator for
    /// this correlation id is closed and the overall response fails. The
    /// underlying request is not retroactively aborted if it already completed.
    #[error("transport send failed: {0}")]
    TransportSend(String),

    /// No outstanding exchange matches the frame's correlation id.
    #[error("no outstanding exchange for correlation id {0}")]
    UnknownCorrelationId(CorrelationId),
}

/// Encodes a frame using the compact text framing `<id>|<tag>|<json>`.
///
/// # Errors
///
/// Returns [`PeerError::InvalidPayload`] if `frame.payload` cannot be encoded as JSON text.
pub fn encode_text_frame(frame: &Frame) -> Result<String, PeerError> {
    let json = serde_json::to_string(&frame.payload)?;
    Ok(format!("{}|{}|{json}", frame.id, frame.kind.as_tag()))
}

/// Decodes a frame from the compact text framing `<id>|<tag>|<json>`.
///
/// # Errors
///
/// Returns [`PeerError::MalformedFrame`] if the `id|tag|json` structure is not
/// present, or [`PeerError::InvalidPayload`] if the json segment does not parse.
pub fn decode_text_frame(text: &str) -> Result<Frame, PeerError> {
    let mut parts = text.splitn(3, '|');
    let id = parts
        .next()
        .ok_or_else(|| PeerError::MalformedFrame(text.to_string()))?;
    let tag = parts
        .next()
        .ok_or_else(|| PeerError::MalformedFrame(text.to_string()))?;
    let json = parts
        .next()
        .ok_or_else(|| PeerError::MalformedFrame(text.to_string()))?;

    let kind = FrameKind::from_tag(tag)
        .ok_or_else(|| PeerError::MalformedFrame(format!("unknown frame tag: {tag}")))?;
    let payload: Value = serde_json::from_str(json)?;

    Ok(Frame {
        id: CorrelationId(id.to_string()),
        kind,
        payload,
    })
}

/// A single `EVENT_ITERATOR` payload item: a message, a terminal `done`, or an `error`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IteratorFrame {
    /// A data item.
    Message {
        /// The item's data.
        data: Value,
        /// Optional event metadata (id, retry hint).
        meta: Option<IteratorMeta>,
    },
    /// The terminal item; `data` carries the iterator's final return value, if any.
    Done {
        /// The iterator's return value, if any.
        data: Option<Value>,
    },
    /// A terminal error; carries metadata but never a payload.
    Error {
        /// Optional event metadata associated with the failure.
        meta: Option<IteratorMeta>,
        /// A human-readable error message.
        message: String,
    },
}

/// Metadata carried on an `EVENT_ITERATOR` frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IteratorMeta {
    /// The event id, when the iterator is backed by a resumable event store.
    pub id: Option<String>,
    /// A client retry hint in milliseconds.
    pub retry: Option<u64>,
}

/// Per-correlation-id state the peer keeps for one outstanding exchange.
enum OutstandingExchange {
    /// Awaiting a single `RESPONSE` frame.
    AwaitingResponse(oneshot::Sender<Frame>),
    /// Draining an `EVENT_ITERATOR` response; each item is forwarded on the channel.
    DrainingIterator(mpsc::UnboundedSender<Frame>),
}

/// Client-side peer: issues requests and correlates responses/iterator frames.
///
/// Keeps only `O(outstanding-requests)` state: one [`OutstandingExchange`]
/// slot per correlation id currently in flight.
pub struct ClientPeer {
    outgoing: mpsc::UnboundedSender<Frame>,
    outstanding: std::sync::Mutex<HashMap<CorrelationId, OutstandingExchange>>,
}

impl ClientPeer {
    /// Builds a client peer that writes frames to `outgoing`.
    #[must_use]
    pub fn new(outgoing: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            outgoing,
            outstanding: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Sends a `REQUEST` frame and awaits its single `RESPONSE`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::TransportSend`] if the outgoing channel is closed.
    pub async fn call(&self, id: CorrelationId, payload: Value) -> Result<Frame, PeerError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut outstanding = self.outstanding.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            outstanding.insert(id.clone(), OutstandingExchange::AwaitingResponse(tx));
        }
        self.outgoing
            .send(Frame {
                id: id.clone(),
                kind: FrameKind::Request,
                payload,
            })
            .map_err(|e| PeerError::TransportSend(e.to_string()))?;

        rx.await.map_err(|_| PeerError::UnknownCorrelationId(id))
    }

    /// Opens an `EVENT_ITERATOR` drain channel for `id`, returning the receiving end.
    ///
    /// Call this before [`ClientPeer::call`] if the caller expects a streamed response,
    /// so no iterator frames are missed between request and the first `EVENT_ITERATOR` item.
    pub fn begin_iterator(&self, id: CorrelationId) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut outstanding = self.outstanding.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        outstanding.insert(id, OutstandingExchange::DrainingIterator(tx));
        rx
    }

    /// Dispatches an inbound frame to the correlation id's outstanding exchange.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::UnknownCorrelationId`] if no exchange is registered for
    /// `frame.id` (the peer does not track state beyond outstanding exchanges).
    pub fn dispatch_inbound(&self, frame: Frame) -> Result<(), PeerError> {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match frame.kind {
            FrameKind::Response => {
                if let Some(OutstandingExchange::AwaitingResponse(tx)) =
                    outstanding.remove(&frame.id)
                {
                    let _ = tx.send(frame);
                    Ok(())
                } else {
                    Err(PeerError::UnknownCorrelationId(frame.id))
                }
            }
            FrameKind::EventIterator => {
                if let Some(OutstandingExchange::DrainingIterator(tx)) = outstanding.get(&frame.id)
                {
                    let _ = tx.send(frame);
                    Ok(())
                } else {
                    Err(PeerError::UnknownCorrelationId(frame.id))
                }
            }
            FrameKind::Request | FrameKind::AbortSignal => {
                Err(PeerError::UnknownCorrelationId(frame.id))
            }
        }
    }

    /// Aborts the exchange identified by `id`, sending an `ABORT_SIGNAL` frame and
    /// tearing down any in-flight iterator state for it.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::TransportSend`] if the outgoing channel is closed.
    pub fn abort(&self, id: CorrelationId) -> Result<(), PeerError> {
        {
            let mut outstanding = self.outstanding.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            outstanding.remove(&id);
        }
        self.outgoing
            .send(Frame {
                id,
                kind: FrameKind::AbortSignal,
                payload: Value::Null,
            })
            .map_err(|e| PeerError::TransportSend(e.to_string()))
    }
}

/// A decoded `REQUEST` frame, as handed to the request handler by [`ServerPeer`].
pub struct IncomingRequest {
    /// The correlation id the eventual response/iterator frames must reuse.
    pub id: CorrelationId,
    /// The request body (scalar value, file, form collection, or a lazy
    /// event sequence described by the caller's own payload shape).
    pub body: Value,
    /// Request headers, when the payload carried a `headers` object
    /// alongside `body`; empty if the sender didn't send any.
    pub headers: HashMap<String, String>,
    /// Cancelled when an `ABORT_SIGNAL` frame arrives for this correlation id.
    pub cancelled: CancellationToken,
}

/// Splits a `REQUEST` frame's payload into `(body, headers)`.
///
/// A payload shaped `{"body": ..., "headers": {...}}` is split accordingly;
/// any other payload (including a bare scalar or an object without a `body`
/// key) is treated as the whole body with no headers.
fn split_request_payload(payload: Value) -> (Value, HashMap<String, String>) {
    match payload {
        Value::Object(mut map) if map.contains_key("body") => {
            let body = map.remove("body").unwrap_or(Value::Null);
            let headers = map
                .remove("headers")
                .and_then(|h| serde_json::from_value::<HashMap<String, String>>(h).ok())
                .unwrap_or_default();
            (body, headers)
        }
        other => (other, HashMap::new()),
    }
}

/// Server-side peer: accepts inbound requests and answers them with a single
/// `RESPONSE` frame or a drained `EVENT_ITERATOR` sequence.
///
/// Keeps only `O(outstanding-requests)` state: one [`CancellationToken`] per
/// correlation id currently being handled, dropped once the exchange ends
/// (a `RESPONSE` is sent, the iterator is ended, or an `ABORT_SIGNAL`
/// arrives).
pub struct ServerPeer {
    outgoing: mpsc::UnboundedSender<Frame>,
    outstanding: std::sync::Mutex<HashMap<CorrelationId, CancellationToken>>,
}

impl ServerPeer {
    /// Builds a server peer that writes frames to `outgoing`.
    #[must_use]
    pub fn new(outgoing: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            outgoing,
            outstanding: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Accepts an inbound `REQUEST` frame, registering its cancellation
    /// signal and returning the request object a handler dispatches on.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::MalformedFrame`] if `frame.kind` is not
    /// [`FrameKind::Request`].
    pub fn accept_request(&self, frame: Frame) -> Result<IncomingRequest, PeerError> {
        if frame.kind != FrameKind::Request {
            return Err(PeerError::MalformedFrame(format!(
                "expected a request frame, got {:?}",
                frame.kind
            )));
        }
        let (body, headers) = split_request_payload(frame.payload);
        let cancelled = CancellationToken::new();
        let mut outstanding = self.outstanding.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        outstanding.insert(frame.id.clone(), cancelled.clone());
        Ok(IncomingRequest {
            id: frame.id,
            body,
            headers,
            cancelled,
        })
    }

    /// Dispatches an inbound `ABORT_SIGNAL` frame, cancelling the matching
    /// request's signal and tearing down its outstanding state.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::UnknownCorrelationId`] if `frame.kind` is not
    /// [`FrameKind::AbortSignal`] or no outstanding request matches its id.
    pub fn dispatch_inbound(&self, frame: Frame) -> Result<(), PeerError> {
        if frame.kind != FrameKind::AbortSignal {
            return Err(PeerError::UnknownCorrelationId(frame.id));
        }
        let mut outstanding = self.outstanding.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(token) = outstanding.remove(&frame.id) {
            token.cancel();
            Ok(())
        } else {
            Err(PeerError::UnknownCorrelationId(frame.id))
        }
    }

    /// Sends the single terminal `RESPONSE` frame for `id`, ending the
    /// exchange and dropping its cancellation signal.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::TransportSend`] if the outgoing channel is closed.
    pub fn respond(&self, id: CorrelationId, payload: Value) -> Result<(), PeerError> {
        {
            let mut outstanding = self.outstanding.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            outstanding.remove(&id);
        }
        self.outgoing
            .send(Frame {
                id,
                kind: FrameKind::Response,
                payload,
            })
            .map_err(|e| PeerError::TransportSend(e.to_string()))
    }

    /// Sends one `EVENT_ITERATOR` item for `id`. The exchange stays
    /// outstanding until a `Done`/`Error` item ends it — callers should stop
    /// sending once they send one of those, the same terminal contract
    /// [`IteratorFrame`] documents for the client side.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::TransportSend`] if the outgoing channel is closed.
    pub fn send_iterator_item(&self, id: CorrelationId, item: &IteratorFrame) -> Result<(), PeerError> {
        let payload = serde_json::to_value(item)?;
        self.outgoing
            .send(Frame {
                id,
                kind: FrameKind::EventIterator,
                payload,
            })
            .map_err(|e| PeerError::TransportSend(e.to_string()))
    }

    /// Drops `id`'s outstanding state without sending a frame, for use once a
    /// `Done`/`Error` iterator item (sent via [`ServerPeer::send_iterator_item`])
    /// has already closed the exchange on the wire.
    pub fn end_iterator(&self, id: &CorrelationId) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        outstanding.remove(id);
    }
}
