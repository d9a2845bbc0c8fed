//! Metric points for publish/subscribe and retry activity.
//!
//! Emits via the `metrics` facade only; no Prometheus (or any other)
//! exporter is wired up here — that belongs to whatever host application
//! links this crate and chooses a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Registers descriptions for every metric this crate emits. Call once at
/// startup, after installing a recorder.
pub fn describe() {
    describe_histogram!("pubsub_publish_duration_seconds", "Time taken to publish an event");
    describe_counter!("pubsub_publish_errors_total", "Total publish failures");
    describe_histogram!(
        "pubsub_resume_fetch_duration_seconds",
        "Time taken to replay events on subscribe"
    );
    describe_counter!(
        "pubsub_resume_fetch_errors_total",
        "Total resume-fetch (replay) failures"
    );
    describe_gauge!(
        "pubsub_active_subscriptions",
        "Number of currently attached subscriptions"
    );
    describe_counter!("pubsub_retry_attempts_total", "Total retry attempts made by the retry engine");
    describe_counter!(
        "pubsub_retry_exhausted_total",
        "Total calls that exhausted retry without succeeding"
    );
}

/// Records a publish call's outcome and latency.
pub fn record_publish(duration: Duration, succeeded: bool) {
    histogram!("pubsub_publish_duration_seconds").record(duration.as_secs_f64());
    if !succeeded {
        counter!("pubsub_publish_errors_total").increment(1);
    }
}

/// Records a resume replay's outcome and latency.
pub fn record_resume_fetch(duration: Duration, succeeded: bool) {
    histogram!("pubsub_resume_fetch_duration_seconds").record(duration.as_secs_f64());
    if !succeeded {
        counter!("pubsub_resume_fetch_errors_total").increment(1);
    }
}

/// Sets the active-subscription gauge to `count`.
pub fn set_active_subscriptions(count: i64) {
    gauge!("pubsub_active_subscriptions").set(count as f64);
}

/// Records one retry attempt.
pub fn record_retry_attempt() {
    counter!("pubsub_retry_attempts_total").increment(1);
}

/// Records a call that exhausted retry without succeeding.
pub fn record_retry_exhausted() {
    counter!("pubsub_retry_exhausted_total").increment(1);
}
