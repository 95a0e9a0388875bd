use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "llm-context-bench")]
#[command(author, version, about = "Benchmark OpenAI-compatible LLM servers across input context sizes", long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    pub config: PathBuf,

    /// Model name (overrides endpoint.model)
    #[arg(long)]
    pub model: Option<String>,

    /// Comma separated context sizes to test, e.g. "13t,1k,4k"
    #[arg(long)]
    pub context_sizes: Option<String>,

    /// Requests per context size
    #[arg(long)]
    pub num_requests: Option<usize>,

    /// Maximum output tokens per request
    #[arg(long)]
    pub output_tokens: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Maximum in-flight requests per context size
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Skip the streaming connectivity check before the run
    #[arg(long)]
    pub skip_stream_check: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
