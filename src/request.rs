use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};

use crate::client::{ChatEndpoint, ClientError};
use crate::consumer::{ConsumeError, StreamConsumer, StreamStats};
use crate::metrics::Metrics;
use crate::outcome::{ErrorKind, RequestMetrics, RequestOutcome};
use crate::templates::Prompt;

/// Sends one prompt, times it, and reports the result as a `RequestOutcome`.
///
/// Errors never escape `request`; every failure is folded into the outcome.
pub struct RequestDriver {
    endpoint: Arc<dyn ChatEndpoint>,
    consumer: StreamConsumer,
    output_tokens: u32,
    timeout: Duration,
}

impl RequestDriver {
    pub fn new(
        endpoint: Arc<dyn ChatEndpoint>,
        consumer: StreamConsumer,
        output_tokens: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            consumer,
            output_tokens,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn request(&self, prompt: Prompt, request_id: String) -> RequestOutcome {
        let start = Instant::now();
        let start_time = Utc::now();

        let prompt_tokens = self.consumer.estimator().estimate(&prompt.text);
        debug!(
            "Request {}: sending prompt with {} chars (~{} tokens)",
            request_id,
            prompt.char_count(),
            prompt_tokens
        );

        Metrics::record_request_sent(prompt_tokens);
        let outcome = self
            .execute(&prompt, request_id, prompt_tokens, start, start_time)
            .await;
        Metrics::record_outcome(&outcome);

        outcome
    }

    async fn execute(
        &self,
        prompt: &Prompt,
        request_id: String,
        prompt_tokens: u64,
        start: Instant,
        start_time: DateTime<Utc>,
    ) -> RequestOutcome {
        let opened = timeout(
            self.timeout,
            self.endpoint.stream_chat(&prompt.text, self.output_tokens),
        )
        .await;

        let stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(ClientError::Timeout(_))) | Err(_) => {
                return self.timed_out(prompt, request_id, prompt_tokens);
            }
            Ok(Err(e)) => {
                warn!(
                    "Request {} with context size {} failed: {}",
                    request_id, prompt.context_size, e
                );
                return RequestOutcome::failed(
                    request_id,
                    prompt,
                    prompt_tokens,
                    ErrorKind::from(&e),
                    e.to_string(),
                );
            }
        };

        debug!("Request {}: stream opened, consuming", request_id);

        let (stats, partial) = match self.consumer.consume(stream, self.timeout).await {
            Ok(stats) => (stats, false),
            // A transport deadline mid-stream is a stall, not a break worth salvaging.
            Err(ConsumeError::Timeout(_))
            | Err(ConsumeError::Interrupted {
                source: ClientError::Timeout(_),
                ..
            }) => {
                return self.timed_out(prompt, request_id, prompt_tokens);
            }
            Err(ConsumeError::Interrupted { partial, source }) => {
                if partial.first_chunk_at.is_none() {
                    warn!(
                        "Request {} with context size {} failed: {}",
                        request_id, prompt.context_size, source
                    );
                    return RequestOutcome::failed(
                        request_id,
                        prompt,
                        prompt_tokens,
                        ErrorKind::from(&source),
                        source.to_string(),
                    );
                }

                // Keep what arrived before the break; reasoning text is not counted.
                let tokens = self.consumer.estimator().estimate(&partial.content).max(1);
                warn!(
                    "Request {}: stream interrupted after {} chunks ({}), keeping {} tokens",
                    request_id, partial.chunk_count, source, tokens
                );
                let stats = StreamStats {
                    first_chunk_at: partial.first_chunk_at,
                    chunk_count: partial.chunk_count,
                    total_tokens: tokens,
                    content_tokens: tokens,
                    reasoning_tokens: 0,
                };
                (stats, true)
            }
        };

        let end = Instant::now();
        let end_time = Utc::now();

        let elapsed = end.duration_since(start).as_secs_f64();
        let ttft = stats
            .first_chunk_at
            .map(|first| first.duration_since(start).as_secs_f64());

        let generation_throughput = if elapsed > 0.0 && stats.total_tokens > 0 {
            stats.total_tokens as f64 / elapsed
        } else {
            0.0
        };
        let prompt_throughput = match ttft {
            Some(ttft) if ttft > 0.0 => prompt_tokens as f64 / ttft,
            _ => 0.0,
        };

        debug!(
            "Request {} completed - tokens: {}, elapsed_s: {:.3}, ttft_ms: {}",
            request_id,
            stats.total_tokens,
            elapsed,
            ttft.map(|t| format!("{:.1}", t * 1000.0))
                .unwrap_or_else(|| "n/a".to_string())
        );

        RequestOutcome::succeeded(
            request_id,
            prompt,
            prompt_tokens,
            RequestMetrics {
                total_tokens: stats.total_tokens,
                content_tokens: stats.content_tokens,
                reasoning_tokens: stats.reasoning_tokens,
                elapsed_time: elapsed,
                ttft,
                generation_throughput,
                prompt_throughput,
                start_time,
                end_time,
                partial,
            },
        )
    }

    fn timed_out(&self, prompt: &Prompt, request_id: String, prompt_tokens: u64) -> RequestOutcome {
        warn!(
            "Request {} with context size {} timed out after {} seconds",
            request_id,
            prompt.context_size,
            self.timeout.as_secs()
        );
        RequestOutcome::failed(
            request_id,
            prompt,
            prompt_tokens,
            ErrorKind::Timeout,
            "timeout",
        )
    }
}
