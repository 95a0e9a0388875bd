use futures::StreamExt;
use log::debug;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, timeout};

use crate::client::{ChunkStream, ClientError};
use crate::tokenizer::{TokenEstimator, is_cjk};

/// Text and timing gathered from a stream so far.
#[derive(Debug, Clone, Default)]
pub struct PartialStream {
    pub first_chunk_at: Option<Instant>,
    pub chunk_count: usize,
    pub content: String,
    pub reasoning: String,
}

/// Token accounting for a fully consumed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub first_chunk_at: Option<Instant>,
    pub chunk_count: usize,
    pub total_tokens: u64,
    pub content_tokens: u64,
    pub reasoning_tokens: u64,
}

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("stream not finished after {0:?}")]
    Timeout(Duration),

    #[error("stream interrupted: {source}")]
    Interrupted {
        partial: PartialStream,
        #[source]
        source: ClientError,
    },
}

/// Drains streamed completions and turns the generated text into token counts.
#[derive(Clone)]
pub struct StreamConsumer {
    estimator: TokenEstimator,
}

impl StreamConsumer {
    pub fn new(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Reads `stream` until a chunk carries a finish reason or the transport
    /// ends. Text gathered before a timeout is dropped.
    pub async fn consume(
        &self,
        stream: ChunkStream,
        limit: Duration,
    ) -> Result<StreamStats, ConsumeError> {
        let partial = timeout(limit, drain(stream))
            .await
            .map_err(|_| ConsumeError::Timeout(limit))??;

        Ok(self.account(partial))
    }

    fn account(&self, partial: PartialStream) -> StreamStats {
        let content_tokens = self.estimator.estimate(&partial.content);
        let reasoning_tokens = self.estimator.estimate(&partial.reasoning);
        let mut total_tokens = content_tokens + reasoning_tokens;
        let mut content_tokens = content_tokens;

        // A response that produced chunks is never reported as zero tokens.
        if partial.chunk_count > 0 && total_tokens == 0 {
            total_tokens = 1;
            content_tokens = 1;
        }

        if !partial.content.is_empty() {
            let cjk = partial.content.chars().filter(|c| is_cjk(*c)).count();
            let total = partial.content.chars().count();
            debug!(
                "Content analysis: total_len={}, cjk_chars={}, other_chars={}",
                total,
                cjk,
                total - cjk
            );
        }

        debug!(
            "Stream processed: {} chunks, content_len={}, reasoning_len={}, content_tokens={}, reasoning_tokens={}, total_tokens={}",
            partial.chunk_count,
            partial.content.len(),
            partial.reasoning.len(),
            content_tokens,
            reasoning_tokens,
            total_tokens
        );
        debug!("Content preview: {}", preview(&partial.content, 100));

        StreamStats {
            first_chunk_at: partial.first_chunk_at,
            chunk_count: partial.chunk_count,
            total_tokens,
            content_tokens,
            reasoning_tokens,
        }
    }
}

async fn drain(mut stream: ChunkStream) -> Result<PartialStream, ConsumeError> {
    let mut acc = PartialStream::default();

    while let Some(item) = stream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(source) => return Err(ConsumeError::Interrupted { partial: acc, source }),
        };

        acc.chunk_count += 1;
        if acc.first_chunk_at.is_none() {
            acc.first_chunk_at = Some(Instant::now());
        }

        if let Some(content) = &chunk.content {
            acc.content.push_str(content);
        }
        if let Some(reasoning) = &chunk.reasoning {
            acc.reasoning.push_str(reasoning);
        }

        if chunk.is_final() {
            break;
        }
    }

    Ok(acc)
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ChatEndpoint, StreamChunk};
    use crate::testing::{MockEndpoint, Script, Step};

    fn consumer() -> StreamConsumer {
        StreamConsumer::new(TokenEstimator::heuristic())
    }

    async fn open(script: Script) -> ChunkStream {
        MockEndpoint::new(script).stream_chat("prompt", 16).await.unwrap()
    }

    const LIMIT: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_content_is_accumulated() {
        let stream = open(Script::chunks(vec![
            StreamChunk::content("He"),
            StreamChunk::content("llo"),
            StreamChunk::finish("stop"),
        ]))
        .await;

        let stats = consumer().consume(stream, LIMIT).await.unwrap();
        let expected = TokenEstimator::heuristic().estimate("Hello");
        assert_eq!(stats.content_tokens, expected);
        assert_eq!(stats.reasoning_tokens, 0);
        assert_eq!(stats.total_tokens, expected);
        assert_eq!(stats.chunk_count, 3);
        assert!(stats.first_chunk_at.is_some());
    }

    #[tokio::test]
    async fn test_reasoning_is_counted_separately() {
        let stream = open(Script::chunks(vec![
            StreamChunk::reasoning("思考".repeat(15)),
            StreamChunk {
                content: Some("x".repeat(8)),
                reasoning: Some("y".repeat(4)),
                finish_reason: None,
            },
            StreamChunk::finish("stop"),
        ]))
        .await;

        let stats = consumer().consume(stream, LIMIT).await.unwrap();
        // 30 ideographs / 1.5 + 4 / 4.0
        assert_eq!(stats.reasoning_tokens, 21);
        assert_eq!(stats.content_tokens, 2);
        assert_eq!(stats.total_tokens, 23);
    }

    #[tokio::test]
    async fn test_whitespace_reply_counts_one_token() {
        let stream = open(Script::chunks(vec![
            StreamChunk::content("  "),
            StreamChunk::finish("stop"),
        ]))
        .await;

        let stats = consumer().consume(stream, LIMIT).await.unwrap();
        assert_eq!(stats.total_tokens, 1);
        assert_eq!(stats.content_tokens, 1);
        assert_eq!(stats.reasoning_tokens, 0);
    }

    #[tokio::test]
    async fn test_chunks_without_text_count_one_token() {
        let stream = open(Script::chunks(vec![
            StreamChunk::default(),
            StreamChunk::finish("length"),
        ]))
        .await;

        let stats = consumer().consume(stream, LIMIT).await.unwrap();
        assert_eq!(stats.total_tokens, 1);
        assert_eq!(stats.content_tokens, 1);
    }

    #[tokio::test]
    async fn test_empty_stream_has_no_tokens() {
        let stream = open(Script::chunks(vec![])).await;

        let stats = consumer().consume(stream, LIMIT).await.unwrap();
        assert_eq!(stats.total_tokens, 0);
        assert_eq!(stats.chunk_count, 0);
        assert!(stats.first_chunk_at.is_none());
    }

    #[tokio::test]
    async fn test_stops_at_finish_reason() {
        let stream = open(Script::steps(vec![
            Step::Chunk(StreamChunk::content("a".repeat(8))),
            Step::Chunk(StreamChunk::finish("stop")),
            Step::Chunk(StreamChunk::content("b".repeat(400))),
            Step::Error(ClientError::Other("never read".into())),
        ]))
        .await;

        let stats = consumer().consume(stream, LIMIT).await.unwrap();
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.content_tokens, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_partial_text() {
        let stream = open(Script::steps(vec![
            Step::Chunk(StreamChunk::content("partial")),
            Step::Delay(Duration::from_secs(60)),
            Step::Chunk(StreamChunk::finish("stop")),
        ]))
        .await;

        let err = consumer()
            .consume(stream, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumeError::Timeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_interruption_keeps_partial_text() {
        let stream = open(Script::steps(vec![
            Step::Chunk(StreamChunk::content("Hel")),
            Step::Chunk(StreamChunk::reasoning("hmm")),
            Step::Error(ClientError::Connection("reset".into())),
        ]))
        .await;

        match consumer().consume(stream, LIMIT).await.unwrap_err() {
            ConsumeError::Interrupted { partial, source } => {
                assert_eq!(partial.content, "Hel");
                assert_eq!(partial.reasoning, "hmm");
                assert_eq!(partial.chunk_count, 2);
                assert!(partial.first_chunk_at.is_some());
                assert!(matches!(source, ClientError::Connection(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_interruption_before_first_chunk() {
        let stream = open(Script::steps(vec![Step::Error(ClientError::Parse(
            "bad".into(),
        ))]))
        .await;

        match consumer().consume(stream, LIMIT).await.unwrap_err() {
            ConsumeError::Interrupted { partial, .. } => {
                assert_eq!(partial.chunk_count, 0);
                assert!(partial.first_chunk_at.is_none());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("你好世界", 2), "你好...");
        assert_eq!(preview("abc", 5), "abc");
    }
}
