pub mod admin;
pub mod analysis;
pub mod benchmark;
pub mod cli;
pub mod client;
pub mod config;
pub mod consumer;
pub mod metrics;
pub mod outcome;
pub mod report;
pub mod request;
pub mod templates;
pub mod tokenizer;

#[cfg(test)]
pub(crate) mod testing;

pub use analysis::{SummaryRecord, summarize};
pub use benchmark::{BenchmarkPlan, BenchmarkRun, BenchmarkRunner, Progress, RunStatus};
pub use cli::Cli;
pub use client::{ChatEndpoint, ClientConfig, ClientError, OpenAIClient, StreamChunk};
pub use config::Config;
pub use consumer::StreamConsumer;
pub use outcome::{ErrorKind, GroupStatus, RequestOutcome, ResultGroup};
pub use request::RequestDriver;
pub use templates::{ContextCatalog, ContextTemplate, Prompt};
pub use tokenizer::TokenEstimator;
