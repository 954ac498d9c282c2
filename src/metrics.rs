use metriken::{AtomicHistogram, Counter, Gauge, LazyCounter, LazyGauge, metric};
use std::time::Duration;

use crate::client::TransportError;

// Live counters for the admin endpoint. Run results are owned by the
// LatencyAggregator; nothing here feeds back into the benchmark.

#[metric(
    name = "requests_sent",
    description = "Requests handed to the transport",
    metadata = { status = "sent" }
)]
pub static REQUESTS_SENT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests_success",
    description = "Successful requests",
    metadata = { status = "success" }
)]
pub static REQUESTS_SUCCESS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests_failed",
    description = "Failed requests",
    metadata = { status = "failed" }
)]
pub static REQUESTS_FAILED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors_connection",
    description = "Connection errors",
    metadata = { "type" = "connection" }
)]
pub static ERRORS_CONNECTION: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors_http_4xx",
    description = "HTTP 4xx errors",
    metadata = { "type" = "http_4xx" }
)]
pub static ERRORS_HTTP_4XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors_http_5xx",
    description = "HTTP 5xx errors",
    metadata = { "type" = "http_5xx" }
)]
pub static ERRORS_HTTP_5XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors_parse",
    description = "Parse errors",
    metadata = { "type" = "parse" }
)]
pub static ERRORS_PARSE: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors_timeout",
    description = "Timed out requests",
    metadata = { "type" = "timeout" }
)]
pub static ERRORS_TIMEOUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors_other",
    description = "Other errors",
    metadata = { "type" = "other" }
)]
pub static ERRORS_OTHER: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens_input",
    description = "Prompt tokens of completed requests",
    metadata = { direction = "input" }
)]
pub static TOKENS_INPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens_output",
    description = "Requested output tokens of completed requests",
    metadata = { direction = "output" }
)]
pub static TOKENS_OUTPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests_inflight",
    description = "Current number of requests in flight"
)]
pub static REQUESTS_INFLIGHT: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(
    name = "requests_remaining",
    description = "Requests not yet completed in the current run"
)]
pub static REQUESTS_REMAINING: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(
    name = "backlog_depth",
    description = "Released requests waiting for a worker"
)]
pub static BACKLOG_DEPTH: LazyGauge = LazyGauge::new(Gauge::default);

// Histogram parameters: (grouping_power=5, max_value_power=64)
#[metric(
    name = "request_latency",
    description = "Total request latency in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static REQUEST_LATENCY: AtomicHistogram = AtomicHistogram::new(5, 64);

/// One request counted in `REQUESTS_INFLIGHT` until dropped, so a send
/// cancelled mid-flight still leaves the gauge.
#[must_use]
pub struct InFlight(());

impl Drop for InFlight {
    fn drop(&mut self) {
        REQUESTS_INFLIGHT.decrement();
    }
}

pub struct Metrics;

impl Metrics {
    pub fn record_run_start(total: usize) {
        REQUESTS_REMAINING.set(total as i64);
    }

    pub fn record_request_sent() -> InFlight {
        REQUESTS_SENT.increment();
        REQUESTS_INFLIGHT.increment();
        InFlight(())
    }

    pub fn record_success(latency: Duration, input_tokens: u64, output_tokens: u64) {
        REQUESTS_SUCCESS.increment();
        TOKENS_INPUT.add(input_tokens);
        TOKENS_OUTPUT.add(output_tokens);
        let _ = REQUEST_LATENCY.increment(latency.as_nanos() as u64);
    }

    pub fn record_failure(error: &TransportError) {
        REQUESTS_FAILED.increment();
        match error {
            TransportError::Connection(_) => ERRORS_CONNECTION.increment(),
            TransportError::Http4xx { .. } => ERRORS_HTTP_4XX.increment(),
            TransportError::Http5xx { .. } => ERRORS_HTTP_5XX.increment(),
            TransportError::Parse(_) => ERRORS_PARSE.increment(),
            TransportError::Timeout(_) => ERRORS_TIMEOUT.increment(),
            TransportError::Other(_) => ERRORS_OTHER.increment(),
        };
    }

    pub fn record_remaining(remaining: usize) {
        REQUESTS_REMAINING.set(remaining as i64);
    }

    pub fn record_backlog_depth(depth: usize) {
        BACKLOG_DEPTH.set(depth as i64);
    }
}
