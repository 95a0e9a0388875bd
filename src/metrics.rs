use metriken::{AtomicHistogram, Counter, Gauge, LazyCounter, LazyGauge, metric};
use std::time::Duration;

use crate::outcome::{ErrorKind, GroupStatus, RequestOutcome};

// Process-wide counters, exposed by the admin server. The benchmark report
// itself is computed from outcomes, not from these.

#[metric(
    name = "requests/sent",
    description = "Total number of requests",
    metadata = { status = "sent" }
)]
pub static REQUESTS_SENT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests/success",
    description = "Successful requests",
    metadata = { status = "success" }
)]
pub static REQUESTS_SUCCESS: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests/failed",
    description = "Failed requests",
    metadata = { status = "failed" }
)]
pub static REQUESTS_FAILED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests/timeout",
    description = "Timed out requests",
    metadata = { status = "timeout" }
)]
pub static REQUESTS_TIMEOUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests/salvaged",
    description = "Interrupted streams kept as partial successes",
    metadata = { status = "salvaged" }
)]
pub static REQUESTS_SALVAGED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors/connection",
    description = "Connection errors",
    metadata = { "type" = "connection" }
)]
pub static ERRORS_CONNECTION: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors/http_4xx",
    description = "HTTP 4xx errors",
    metadata = { "type" = "http_4xx" }
)]
pub static ERRORS_HTTP_4XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors/http_5xx",
    description = "HTTP 5xx errors",
    metadata = { "type" = "http_5xx" }
)]
pub static ERRORS_HTTP_5XX: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors/parse",
    description = "Parse errors",
    metadata = { "type" = "parse" }
)]
pub static ERRORS_PARSE: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "errors/other",
    description = "Other errors",
    metadata = { "type" = "other" }
)]
pub static ERRORS_OTHER: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens/input",
    description = "Estimated prompt tokens sent",
    metadata = { direction = "input" }
)]
pub static TOKENS_INPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens/output",
    description = "Estimated tokens generated (content and reasoning)",
    metadata = { direction = "output" }
)]
pub static TOKENS_OUTPUT: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "tokens/reasoning",
    description = "Estimated reasoning tokens generated",
    metadata = { direction = "reasoning" }
)]
pub static TOKENS_REASONING: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "requests_inflight",
    description = "Current number of requests in flight"
)]
pub static REQUESTS_INFLIGHT: LazyGauge = LazyGauge::new(Gauge::default);

#[metric(
    name = "context_groups/completed",
    description = "Context sizes that finished every request",
    metadata = { status = "completed" }
)]
pub static GROUPS_COMPLETED: LazyCounter = LazyCounter::new(Counter::default);

#[metric(
    name = "context_groups/aborted",
    description = "Context sizes abandoned after a failure",
    metadata = { status = "aborted" }
)]
pub static GROUPS_ABORTED: LazyCounter = LazyCounter::new(Counter::default);

// Histogram parameters: (grouping_power=5, max_value_power=64)
#[metric(
    name = "ttft",
    description = "Time to first token in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static TTFT: AtomicHistogram = AtomicHistogram::new(5, 64);

#[metric(
    name = "request_latency",
    description = "Total request latency in nanoseconds",
    metadata = { unit = "nanoseconds" }
)]
pub static REQUEST_LATENCY: AtomicHistogram = AtomicHistogram::new(5, 64);

pub struct Metrics;

impl Metrics {
    pub fn record_request_sent(prompt_tokens: u64) {
        REQUESTS_SENT.increment();
        REQUESTS_INFLIGHT.increment();
        TOKENS_INPUT.add(prompt_tokens);
    }

    pub fn record_outcome(outcome: &RequestOutcome) {
        REQUESTS_INFLIGHT.decrement();

        if let Some(metrics) = &outcome.metrics {
            REQUESTS_SUCCESS.increment();
            if metrics.partial {
                REQUESTS_SALVAGED.increment();
            }
            TOKENS_OUTPUT.add(metrics.total_tokens);
            TOKENS_REASONING.add(metrics.reasoning_tokens);
            let _ = REQUEST_LATENCY.increment(nanos(metrics.elapsed_time));
            if let Some(ttft) = metrics.ttft {
                let _ = TTFT.increment(nanos(ttft));
            }
            return;
        }

        match outcome.error_kind() {
            Some(ErrorKind::Timeout) => {
                REQUESTS_TIMEOUT.increment();
            }
            Some(kind) => {
                REQUESTS_FAILED.increment();
                match kind {
                    ErrorKind::Connection => ERRORS_CONNECTION.increment(),
                    ErrorKind::Http4xx => ERRORS_HTTP_4XX.increment(),
                    ErrorKind::Http5xx => ERRORS_HTTP_5XX.increment(),
                    ErrorKind::Parse => ERRORS_PARSE.increment(),
                    ErrorKind::Other | ErrorKind::Timeout => ERRORS_OTHER.increment(),
                };
            }
            None => {
                REQUESTS_FAILED.increment();
                ERRORS_OTHER.increment();
            }
        }
    }

    pub fn record_group(status: GroupStatus) {
        match status {
            GroupStatus::Completed => GROUPS_COMPLETED.increment(),
            GroupStatus::Aborted => GROUPS_ABORTED.increment(),
        };
    }
}

fn nanos(seconds: f64) -> u64 {
    Duration::from_secs_f64(seconds.max(0.0)).as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos_conversion() {
        assert_eq!(nanos(1.5), 1_500_000_000);
        assert_eq!(nanos(-1.0), 0);
    }

    #[test]
    fn test_group_counters_increase() {
        let before = GROUPS_ABORTED.value();
        Metrics::record_group(GroupStatus::Aborted);
        assert!(GROUPS_ABORTED.value() > before);
    }
}
