//! Retry/resume engine for RPC calls and event iterators
//!
//! A single retry loop drives both plain calls and event-iterator calls:
//! attempt zero always runs, a failure consults `shouldRetry`/`maxAttempts`/
//! `retryTimeoutMs` and a response's `Retry-After` hint to compute the next
//! delay, `onRetry` is notified before sleeping, and the loop either resolves
//! or rethrows the last error verbatim. [`resume_event_stream`] wraps an
//! iterator-producing call so that an inner `next` failure reruns the call
//! with the last observed event id and stitches the replacement iterator in.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use futures::stream::{Stream, StreamExt};
use pubsub_core::event::{Event, EventId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors raised by the retry engine itself, distinct from the underlying call's error type.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The underlying call failed and retry was exhausted, disabled, or the signal fired.
    /// Carries the verbatim last error, timeouts rethrow the last error verbatim, never a new one.
    #[error(transparent)]
    Underlying(E),

    /// A resumed event-iterator call returned a value that was not itself an iterator.
    #[error("resumed call did not return an event iterator")]
    ExpectedEventIterator,
}

/// Context captured alongside a call failure, consulted when computing the next delay.
///
/// `Retry-After` is read from exactly this one captured context, never from
/// a secondary extraction path off the error value itself.
#[derive(Clone, Debug, Default)]
pub struct ResponseContext {
    /// The `retry-after` response header, if present, unparsed.
    pub retry_after: Option<String>,

    /// The `retry` hint carried on the last delivered event's metadata, if resuming an iterator.
    pub last_event_retry_ms: Option<u64>,
}

/// Parses a `Retry-After` header value into a delay.
///
/// Accepts a non-negative integer (seconds) or an HTTP-date in IMF-fixdate
/// form (`"Sun, 06 Nov 1994 08:49:37 GMT"`); invalid values are ignored
/// (returns `None`) rather than failing the call.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let parsed = chrono::NaiveDateTime::parse_from_str(trimmed, "%a, %d %b %Y %H:%M:%S GMT").ok()?;
    let target = parsed.and_utc();
    let now = chrono::Utc::now();
    (target - now).to_std().ok()
}

/// Per-call retry configuration. Defaults come from the plugin/client construction site.
pub struct RetryConfig<E> {
    /// Maximum number of retry attempts after the first. `0` disables retry entirely.
    pub max_attempts: u32,

    /// Wall-clock bound over all attempts, including the first.
    pub retry_timeout: Duration,

    /// Computes the delay before the next attempt, given the attempt index (0-based,
    /// counting retries) and the captured response context from the last failure.
    pub retry_delay: Box<dyn Fn(u32, &ResponseContext) -> Duration + Send + Sync>,

    /// Decides whether a given error should be retried at all. Defaults to always-true.
    pub should_retry: Box<dyn Fn(&E) -> bool + Send + Sync>,

    /// Notified before each retry sleep with the attempt index that just failed.
    pub on_retry: Box<dyn Fn(u32) + Send + Sync>,

    /// Cooperative cancellation, checked before each attempt and before each sleep.
    pub signal: Option<CancellationToken>,
}

impl<E> Default for RetryConfig<E> {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_timeout: Duration::from_secs(30),
            retry_delay: Box::new(|attempt, ctx| {
                if let Some(retry_after) = ctx.retry_after.as_deref().and_then(parse_retry_after) {
                    return retry_after;
                }
                if let Some(ms) = ctx.last_event_retry_ms {
                    return Duration::from_millis(ms);
                }
                Duration::from_millis(100 * 2u64.saturating_pow(attempt))
            }),
            should_retry: Box::new(|_| true),
            on_retry: Box::new(|_| {}),
            signal: None,
        }
    }
}

/// The error/context pair an attempt returns on failure: the underlying error
/// plus whatever response metadata the retry delay function should consult.
pub struct AttemptFailure<E> {
    /// The underlying error.
    pub error: E,
    /// Response metadata captured alongside the error, for `retry_delay`.
    pub context: ResponseContext,
}

/// Runs `attempt` under `config`'s retry policy.
///
/// Implements the state machine `INIT -> CALL -> DONE | DECIDE -> WAIT -> CALL`:
/// attempt 0 always runs; on failure, an aborted signal or exhausted attempts/timeout
/// rethrows the last error verbatim; otherwise the configured delay is awaited
/// (bounded so it never pushes total elapsed past `retry_timeout`) and the loop repeats.
///
/// # Errors
///
/// Returns [`RetryError::Underlying`] carrying the last attempt's error once
/// retry is exhausted, disabled, rejected by `should_retry`, or the signal fires.
pub async fn retry_call<F, Fut, T, E>(
    config: &RetryConfig<E>,
    mut attempt: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptFailure<E>>>,
{
    let started = Instant::now();
    let mut attempt_index = 0u32;
    let mut last_failure: Option<AttemptFailure<E>> = None;

    loop {
        if let Some(signal) = &config.signal {
            if signal.is_cancelled() {
                // Attempt 0 always runs unconditionally per the state machine;
                // a signal fired before it starts still gets one attempt. Once
                // an attempt has already run, a cancelled signal rethrows its
                // failure without calling attempt again.
                if let Some(failure) = last_failure {
                    return Err(RetryError::Underlying(failure.error));
                }
            }
        }

        match attempt(attempt_index).await {
            Ok(value) => return Ok(value),
            Err(failure) => {
                if let Some(signal) = &config.signal {
                    if signal.is_cancelled() {
                        return Err(RetryError::Underlying(failure.error));
                    }
                }

                if !(config.should_retry)(&failure.error) {
                    return Err(RetryError::Underlying(failure.error));
                }

                if attempt_index >= config.max_attempts {
                    warn!(attempts = attempt_index + 1, "retry exhausted, rethrowing last error");
                    return Err(RetryError::Underlying(failure.error));
                }

                let elapsed = started.elapsed();
                if elapsed >= config.retry_timeout {
                    warn!(?elapsed, "retry wall-clock timeout, rethrowing last error");
                    return Err(RetryError::Underlying(failure.error));
                }

                let delay = (config.retry_delay)(attempt_index, &failure.context);
                if elapsed + delay > config.retry_timeout {
                    warn!("next retry delay would exceed retry_timeout, rethrowing last error");
                    return Err(RetryError::Underlying(failure.error));
                }

                (config.on_retry)(attempt_index);
                debug!(attempt = attempt_index, ?delay, "retrying after delay");
                tokio::time::sleep(delay).await;
                attempt_index += 1;
                last_failure = Some(failure);
            }
        }
    }
}

/// An event stream paired with a callback producing a replacement stream, used
/// to resume an iterator subscription across a transient failure.
type EventResult<E> = Result<Event<pubsub_core::serializer::SerializedPayload>, E>;

/// A boxed stream of attempt results, as returned by a `resume_event_stream` producer.
pub type BoxEventStream<E> = Pin<Box<dyn Stream<Item = EventResult<E>> + Send>>;

/// Wraps an iterator-producing call with the retry engine.
///
/// On an inner stream failure, the engine reruns `produce` with `last_event_id`
/// set from the last yielded event's metadata and splices the replacement
/// stream's remaining items in, stitching a single logical stream. If a
/// resumed call's result type cannot itself be iterated, callers surface
/// [`RetryError::ExpectedEventIterator`] from `produce`.
pub fn resume_event_stream<F, Fut, E>(
    config: RetryConfig<E>,
    mut produce: F,
) -> impl Stream<Item = Result<Event<pubsub_core::serializer::SerializedPayload>, RetryError<E>>>
where
    F: FnMut(Option<EventId>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<BoxEventStream<E>, AttemptFailure<E>>> + Send,
    E: Send + 'static,
{
    async_stream::stream! {
        let mut last_event_id: Option<EventId> = None;
        let mut current = match retry_call(&config, |_attempt| produce(last_event_id.clone())).await {
            Ok(stream) => stream,
            Err(error) => {
                yield Err(error);
                return;
            }
        };

        loop {
            match current.next().await {
                Some(Ok(event)) => {
                    last_event_id = event.id().cloned();
                    yield Ok(event);
                }
                Some(Err(_failed)) => {
                    match retry_call(&config, |_attempt| produce(last_event_id.clone())).await {
                        Ok(stream) => current = stream,
                        Err(error) => {
                            yield Err(error);
                            return;
                        }
                    }
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting_config(max_attempts: u32, delay: Duration) -> (RetryConfig<String>, Arc<AtomicU32>) {
        let retries_notified = Arc::new(AtomicU32::new(0));
        let notified = Arc::clone(&retries_notified);
        let config = RetryConfig {
            max_attempts,
            retry_timeout: Duration::from_secs(10),
            retry_delay: Box::new(move |_attempt, _ctx| delay),
            should_retry: Box::new(|_| true),
            on_retry: Box::new(move |_attempt| {
                notified.fetch_add(1, Ordering::SeqCst);
            }),
            signal: None,
        };
        (config, retries_notified)
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_retry_notifications() {
        let (config, notified) = counting_config(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<i32, RetryError<String>> = retry_call(&config, move |_attempt| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_until_success_and_notifies_attempts_minus_one() {
        let (config, notified) = counting_config(5, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<i32, RetryError<String>> = retry_call(&config, move |_attempt| {
            let calls = Arc::clone(&calls_clone);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(AttemptFailure {
                        error: "transient".to_string(),
                        context: ResponseContext::default(),
                    })
                } else {
                    Ok(99)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rethrows_last_error_verbatim_on_exhaustion() {
        let (config, _) = counting_config(2, Duration::from_millis(1));

        let result: Result<i32, RetryError<String>> = retry_call(&config, move |attempt| async move {
            Err(AttemptFailure {
                error: format!("failure at attempt {attempt}"),
                context: ResponseContext::default(),
            })
        })
        .await;

        match result {
            Err(RetryError::Underlying(message)) => assert_eq!(message, "failure at attempt 2"),
            other => panic!("expected exhausted underlying error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn should_retry_false_stops_immediately() {
        let mut config = counting_config(5, Duration::from_millis(1)).0;
        config.should_retry = Box::new(|_| false);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<i32, RetryError<String>> = retry_call(&config, move |_attempt| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AttemptFailure {
                    error: "permanent".to_string(),
                    context: ResponseContext::default(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wall_clock_timeout_bounds_total_attempts() {
        let config = RetryConfig {
            max_attempts: 10,
            retry_timeout: Duration::from_millis(250),
            retry_delay: Box::new(|_attempt, _ctx| Duration::from_millis(100)),
            should_retry: Box::new(|_| true),
            on_retry: Box::new(|_| {}),
            signal: None,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let started = Instant::now();

        let result: Result<i32, RetryError<String>> = retry_call(&config, move |_attempt| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AttemptFailure {
                    error: "always fails".to_string(),
                    context: ResponseContext::default(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "elapsed was {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(400), "elapsed was {elapsed:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 3, "initial attempt plus 2 retries");
    }

    #[test]
    fn parses_integer_seconds() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
    }

    #[test]
    fn ignores_invalid_retry_after_values() {
        assert_eq!(parse_retry_after("not-a-date-or-int"), None);
    }
}
