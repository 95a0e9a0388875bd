//! Scripted in-memory endpoint used by unit tests.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::{ChatEndpoint, ChunkStream, ClientError, StreamChunk};

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Chunk(StreamChunk),
    Error(ClientError),
    Delay(Duration),
}

/// What a single `stream_chat` call does.
#[derive(Debug, Clone)]
pub(crate) struct Script {
    open_delay: Duration,
    open: Result<Vec<Step>, ClientError>,
}

impl Script {
    pub(crate) fn steps(steps: Vec<Step>) -> Self {
        Self {
            open_delay: Duration::ZERO,
            open: Ok(steps),
        }
    }

    pub(crate) fn chunks(chunks: Vec<StreamChunk>) -> Self {
        Self::steps(chunks.into_iter().map(Step::Chunk).collect())
    }

    /// Streams `text` one character per chunk, then a stop marker.
    pub(crate) fn reply(text: &str) -> Self {
        let mut chunks: Vec<StreamChunk> = text
            .chars()
            .map(|c| StreamChunk::content(c.to_string()))
            .collect();
        chunks.push(StreamChunk::finish("stop"));
        Self::chunks(chunks)
    }

    pub(crate) fn fail(error: ClientError) -> Self {
        Self {
            open_delay: Duration::ZERO,
            open: Err(error),
        }
    }

    pub(crate) fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }
}

struct InflightGuard {
    inflight: Arc<AtomicUsize>,
}

impl InflightGuard {
    fn enter(inflight: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { inflight }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Plays queued scripts in call order, then repeats the fallback script.
/// Tracks how many calls are open at once; a call stays open until its
/// stream is dropped.
pub(crate) struct MockEndpoint {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    prompts: Mutex<Vec<String>>,
    inflight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

impl MockEndpoint {
    pub(crate) fn new(fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            prompts: Mutex::new(Vec::new()),
            inflight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_scripts(fallback: Script, scripts: Vec<Script>) -> Self {
        let endpoint = Self::new(fallback);
        endpoint.scripts.lock().unwrap().extend(scripts);
        endpoint
    }

    pub(crate) fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub(crate) fn peak_inflight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatEndpoint for MockEndpoint {
    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream_chat(&self, prompt: &str, _max_tokens: u32) -> Result<ChunkStream, ClientError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let guard = InflightGuard::enter(Arc::clone(&self.inflight), &self.peak);

        if !script.open_delay.is_zero() {
            tokio::time::sleep(script.open_delay).await;
        }

        let steps = script.open?;

        let stream = stream::iter(steps).filter_map(move |step| {
            let _open = &guard;
            async move {
                match step {
                    Step::Chunk(chunk) => Some(Ok(chunk)),
                    Step::Error(error) => Some(Err(error)),
                    Step::Delay(delay) => {
                        tokio::time::sleep(delay).await;
                        None
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
