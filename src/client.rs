use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP {status} client error: {message}")]
    Http4xx { status: u16, message: String },

    #[error("HTTP {status} server error: {message}")]
    Http5xx { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Other error: {0}")]
    Other(String),
}

impl ClientError {
    fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_connect() {
            ClientError::Connection(e.to_string())
        } else if e.is_timeout() {
            ClientError::Timeout(timeout)
        } else if e.is_decode() || e.is_body() {
            ClientError::Other(format!("Body error: {}", e))
        } else if e.is_request() {
            let err_msg = e.to_string();
            if err_msg.contains("connection closed")
                || err_msg.contains("connection reset")
                || err_msg.contains("broken pipe")
                || err_msg.contains("connection refused")
            {
                ClientError::Connection(format!("Request error: {}", e))
            } else {
                ClientError::Other(format!("Request error: {}", e))
            }
        } else {
            ClientError::Other(e.to_string())
        }
    }
}

/// One streamed increment of a chat completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub content: Option<String>,
    /// Secondary channel some models use for chain-of-thought output
    pub reasoning: Option<String>,
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn is_final(&self) -> bool {
        self.finish_reason.is_some()
    }
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, ClientError>>;

/// A streaming chat-completion service.
#[async_trait]
pub trait ChatEndpoint: Send + Sync {
    fn model(&self) -> &str;

    /// Submits a single-message chat request and returns its chunk stream.
    async fn stream_chat(&self, prompt: &str, max_tokens: u32) -> Result<ChunkStream, ClientError>;
}

// Request types for OpenAI Chat Completions API
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

// Streaming response types
#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    // vLLM and some gateways use the shorter name
    #[serde(default)]
    reasoning: Option<String>,
}

impl From<ChatCompletionChunk> for StreamChunk {
    fn from(chunk: ChatCompletionChunk) -> Self {
        match chunk.choices.into_iter().next() {
            Some(choice) => StreamChunk {
                content: choice.delta.content,
                reasoning: choice.delta.reasoning_content.or(choice.delta.reasoning),
                finish_reason: choice.finish_reason,
            },
            // Usage-only chunks carry no choices
            None => StreamChunk::default(),
        }
    }
}

// Models list response
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<Model>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub owned_by: String,
}

#[derive(Debug)]
enum SseEvent {
    Chunk(StreamChunk),
    Done,
}

/// Events decoded from one read, and the error that cut it short, if any.
/// Events ahead of a bad line are still delivered.
#[derive(Debug, Default)]
struct Decoded {
    events: Vec<SseEvent>,
    error: Option<ClientError>,
}

impl Decoded {
    fn push(&mut self, parsed: Result<Option<SseEvent>, ClientError>) -> bool {
        match parsed {
            Ok(Some(event)) => {
                let done = matches!(event, SseEvent::Done);
                self.events.push(event);
                !done
            }
            Ok(None) => true,
            Err(e) => {
                self.error = Some(e);
                false
            }
        }
    }
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Network reads do not respect line or UTF-8 boundaries, so bytes are
/// buffered until a full line is available.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Decodes every complete line, stopping at `[DONE]` or the first bad line.
    fn feed(&mut self, bytes: &[u8]) -> Decoded {
        self.buffer.extend_from_slice(bytes);

        let mut decoded = Decoded::default();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if !decoded.push(Self::parse_line(&line)) {
                self.buffer.clear();
                break;
            }
        }
        decoded
    }

    fn finish(&mut self) -> Decoded {
        let line = std::mem::take(&mut self.buffer);
        let mut decoded = Decoded::default();
        decoded.push(Self::parse_line(&line));
        decoded
    }

    fn parse_line(line: &[u8]) -> Result<Option<SseEvent>, ClientError> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\r', '\n']);

        // Comments, event names and keep-alives carry no payload
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim_start();

        if data.is_empty() {
            return Ok(None);
        }
        if data == "[DONE]" {
            return Ok(Some(SseEvent::Done));
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(data).map_err(|e| ClientError::Parse(e.to_string()))?;

        if let Some(error) = chunk.error {
            return Err(ClientError::Other(format!("stream error event: {}", error)));
        }

        Ok(Some(SseEvent::Chunk(chunk.into())))
    }
}

struct SseState {
    response: Option<reqwest::Response>,
    decoder: SseDecoder,
    pending: VecDeque<StreamChunk>,
    /// Yielded once `pending` drains
    failed: Option<ClientError>,
    timeout: Duration,
}

impl SseState {
    fn enqueue(&mut self, decoded: Decoded) {
        for event in decoded.events {
            match event {
                SseEvent::Chunk(chunk) => self.pending.push_back(chunk),
                SseEvent::Done => {
                    self.response = None;
                    break;
                }
            }
        }
        if let Some(e) = decoded.error {
            self.response = None;
            self.failed = Some(e);
        }
    }
}

fn sse_stream(response: reqwest::Response, timeout: Duration) -> ChunkStream {
    let state = SseState {
        response: Some(response),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        failed: None,
        timeout,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Some((Ok(chunk), state));
            }
            if let Some(e) = state.failed.take() {
                return Some((Err(e), state));
            }

            let response = state.response.as_mut()?;
            let decoded = match response.chunk().await {
                Ok(Some(bytes)) => state.decoder.feed(&bytes),
                Ok(None) => {
                    state.response = None;
                    state.decoder.finish()
                }
                Err(e) => {
                    state.response = None;
                    return Some((Err(ClientError::from_reqwest(e, state.timeout)), state));
                }
            };
            state.enqueue(decoded);
        }
    })
    .boxed()
}

/// Configuration for creating an OpenAI client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the OpenAI-compatible API endpoint
    pub base_url: String,
    /// Optional API key for authentication
    pub api_key: Option<String>,
    /// Model name to use for requests
    pub model: String,
    /// TCP connect timeout. The request and its stream are bounded by the
    /// caller, so the client itself sets no overall deadline.
    pub connect_timeout: Duration,
    /// Connection pool size (should match concurrency)
    pub pool_size: usize,
}

/// HTTP client for OpenAI-compatible streaming chat completions.
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl OpenAIClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_size)
            .pool_idle_timeout(Duration::from_secs(300))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            model: config.model,
            timeout: config.connect_timeout,
        })
    }

    pub fn create_request(&self, prompt: &str, max_tokens: u32) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: Some(max_tokens),
            stream: true,
        }
    }
}

#[async_trait]
impl ChatEndpoint for OpenAIClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, prompt: &str, max_tokens: u32) -> Result<ChunkStream, ClientError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self.create_request(prompt, max_tokens);

        let mut req = self
            .client
            .post(&url)
            .json(&request)
            .header("Accept", "text/event-stream");

        if let Some(api_key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            let status_code = response.status().as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());

            return Err(if (400..500).contains(&status_code) {
                ClientError::Http4xx {
                    status: status_code,
                    message: text,
                }
            } else if (500..600).contains(&status_code) {
                ClientError::Http5xx {
                    status: status_code,
                    message: text,
                }
            } else {
                ClientError::Other(format!("HTTP {}: {}", status_code, text))
            });
        }

        Ok(sse_stream(response, self.timeout))
    }
}

/// Result of the pre-run streaming check.
#[derive(Debug, Clone)]
pub struct StreamCheck {
    pub chunks: usize,
    pub content: String,
}

/// Sends a tiny streamed request to confirm the server delivers SSE chunks.
pub async fn check_stream(endpoint: &dyn ChatEndpoint) -> Result<StreamCheck> {
    let mut stream = endpoint.stream_chat("请说'你好'", 10).await?;

    let mut check = StreamCheck {
        chunks: 0,
        content: String::new(),
    };

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        check.chunks += 1;
        if let Some(content) = &chunk.content {
            check.content.push_str(content);
        }
        if chunk.is_final() {
            break;
        }
    }

    if check.chunks == 0 {
        anyhow::bail!("server closed the stream without sending any chunks");
    }

    Ok(check)
}

/// Polls `GET {base_url}/models` until it answers, or fails once `wait` has
/// elapsed. A listing endpoint that responds means the server can take
/// requests, not only that the port is open.
pub async fn check_server_ready(
    base_url: &str,
    api_key: Option<&str>,
    wait: Duration,
    interval: Duration,
) -> Result<()> {
    const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

    let started = Instant::now();
    let deadline = started + wait;
    log::info!("Waiting up to {:?} for {} to become ready", wait, base_url);

    for attempt in 1.. {
        let poll = tokio::time::timeout(
            ATTEMPT_TIMEOUT,
            list_models(base_url, api_key, ATTEMPT_TIMEOUT),
        );
        match poll.await {
            Ok(Ok(models)) => {
                log::info!(
                    "Server ready after {:.1}s with {} model(s)",
                    started.elapsed().as_secs_f64(),
                    models.len()
                );
                return Ok(());
            }
            Ok(Err(e)) => log::debug!("Readiness check {} failed: {}", attempt, e),
            Err(_) => log::debug!("Readiness check {} timed out", attempt),
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }

    anyhow::bail!(
        "server at {} not ready after {:.1}s",
        base_url,
        wait.as_secs_f64()
    )
}

pub async fn list_models(
    base_url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<Vec<Model>> {
    let client = Client::builder().timeout(timeout).build()?;

    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let mut req = client.get(&url);

    if let Some(key) = api_key {
        req = req.header("Authorization", format!("Bearer {}", key));
    }

    let response = req
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query models endpoint: {}", e))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response".to_string());
        anyhow::bail!("Models endpoint returned {}: {}", status, text);
    }

    let models_response: ModelsResponse = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse models response: {}", e))?;

    Ok(models_response.data)
}

/// Picks the first model the server advertises.
pub async fn detect_model(
    base_url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<String> {
    let models = list_models(base_url, api_key, timeout).await?;

    let Some(first) = models.first() else {
        anyhow::bail!("No models available from server at {}/models", base_url);
    };

    if models.len() > 1 {
        log::info!("Found {} models, using: {}", models.len(), first.id);
        log::debug!(
            "Available models: {:?}",
            models.iter().map(|m| &m.id).collect::<Vec<_>>()
        );
    } else {
        log::info!("Detected model: {}", first.id);
    }

    Ok(first.id.clone())
}
