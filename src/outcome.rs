use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client::ClientError;
use crate::templates::Prompt;

/// Why a request produced no usable measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    Http4xx,
    Http5xx,
    Parse,
    Other,
}

impl From<&ClientError> for ErrorKind {
    fn from(error: &ClientError) -> Self {
        match error {
            ClientError::Connection(_) => ErrorKind::Connection,
            ClientError::Http4xx { .. } => ErrorKind::Http4xx,
            ClientError::Http5xx { .. } => ErrorKind::Http5xx,
            ClientError::Parse(_) => ErrorKind::Parse,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::Other(_) => ErrorKind::Other,
        }
    }
}

/// Measurements of a request that streamed a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMetrics {
    pub total_tokens: u64,
    pub content_tokens: u64,
    pub reasoning_tokens: u64,
    /// Seconds from request start to the end of the stream
    pub elapsed_time: f64,
    /// Seconds from request start to the first chunk
    pub ttft: Option<f64>,
    pub generation_throughput: f64,
    pub prompt_throughput: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// The stream broke after data arrived and the partial text was kept
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestFailure {
    pub error_kind: ErrorKind,
    pub error: String,
}

/// Result of one request attempt. Failures still carry the prompt figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOutcome {
    pub success: bool,
    pub request_id: String,
    pub context_size: String,
    pub context_char_count: usize,
    pub prompt_char_count: usize,
    pub prompt_tokens_estimate: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(flatten)]
    pub metrics: Option<RequestMetrics>,
    #[serde(flatten)]
    pub failure: Option<RequestFailure>,
}

impl RequestOutcome {
    pub fn succeeded(
        request_id: String,
        prompt: &Prompt,
        prompt_tokens_estimate: u64,
        metrics: RequestMetrics,
    ) -> Self {
        Self {
            success: true,
            request_id,
            context_size: prompt.context_size.clone(),
            context_char_count: prompt.context_char_count,
            prompt_char_count: prompt.char_count(),
            prompt_tokens_estimate,
            question: prompt.question.clone(),
            metrics: Some(metrics),
            failure: None,
        }
    }

    pub fn failed(
        request_id: String,
        prompt: &Prompt,
        prompt_tokens_estimate: u64,
        error_kind: ErrorKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            request_id,
            context_size: prompt.context_size.clone(),
            context_char_count: prompt.context_char_count,
            prompt_char_count: prompt.char_count(),
            prompt_tokens_estimate,
            question: prompt.question.clone(),
            metrics: None,
            failure: Some(RequestFailure {
                error_kind,
                error: error.into(),
            }),
        }
    }

    /// A failure for an attempt whose task died before producing an outcome.
    pub fn aborted(
        request_id: String,
        context_size: &str,
        context_char_count: usize,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            request_id,
            context_size: context_size.to_string(),
            context_char_count,
            prompt_char_count: 0,
            prompt_tokens_estimate: 0,
            question: None,
            metrics: None,
            failure: Some(RequestFailure {
                error_kind: ErrorKind::Other,
                error: error.into(),
            }),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|f| f.error_kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Completed,
    /// At least one request failed; no later context size runs
    Aborted,
}

/// All outcomes for one context size, in launch order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultGroup {
    pub context_size: String,
    pub concurrency: usize,
    pub status: GroupStatus,
    pub results: Vec<RequestOutcome>,
}

impl ResultGroup {
    pub fn successes(&self) -> impl Iterator<Item = (&RequestOutcome, &RequestMetrics)> {
        self.results
            .iter()
            .filter_map(|r| r.metrics.as_ref().map(|m| (r, m)))
    }

    pub fn failure_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn is_aborted(&self) -> bool {
        self.status == GroupStatus::Aborted
    }
}
