use anyhow::{Context, Result};
use chrono::Utc;
use llm_context_bench::benchmark::{BenchmarkPlan, BenchmarkRunner, RunStatus};
use llm_context_bench::client::{self, ChatEndpoint, ClientConfig, OpenAIClient};
use llm_context_bench::config::LogConfig;
use llm_context_bench::consumer::StreamConsumer;
use llm_context_bench::report::{self, ConsoleProgress, ReportFiles};
use llm_context_bench::request::RequestDriver;
use llm_context_bench::{Cli, Config, ContextCatalog, TokenEstimator, summarize};
use log::{LevelFilter, Metadata, Record, debug, info, warn};
use ringlog::{File, LogBuilder, MultiLogBuilder, Output, Stderr};
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Maximum log file size before rotation (10MB)
const LOG_FILE_MAX_SIZE: u64 = 1024 * 1024 * 10;

/// Parse log filter strings like "hyper=info" into a map of module prefix to level filter
fn parse_log_filters(filters: &[String]) -> HashMap<String, LevelFilter> {
    filters
        .iter()
        .filter_map(|filter| {
            let (module, level) = filter.split_once('=')?;
            let level = level.trim().parse::<LevelFilter>().ok()?;
            Some((module.trim().to_string(), level))
        })
        .collect()
}

/// Longest matching module prefix wins; targets with no filter pass through
/// to the global level.
fn should_log(metadata: &Metadata, filters: &HashMap<String, LevelFilter>) -> bool {
    let target = metadata.target();

    filters
        .iter()
        .filter(|(prefix, _)| target.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
        .is_none_or(|(_, level)| metadata.level() <= *level)
}

/// Custom logger with per-module filtering that wraps a ringlog output
struct FilteredLogger {
    output: Mutex<Box<dyn Output>>,
    max_level: LevelFilter,
    filters: HashMap<String, LevelFilter>,
}

impl log::Log for FilteredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level && should_log(metadata, &self.filters)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata())
            && let Ok(mut output) = self.output.lock()
        {
            let message = format!(
                "{} {:<5} [{}] {}\n",
                Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false),
                record.level(),
                record.target(),
                record.args()
            );
            let _ = output.write_all(message.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut output) = self.output.lock() {
            let _ = output.flush();
        }
    }
}

fn init_logging(config: &LogConfig) -> Result<()> {
    let log_level = config.level.to_level_filter();

    let output: Box<dyn Output> = match &config.file {
        Some(path) => {
            let backup = path.with_extension("old");
            Box::new(File::new(path.clone(), backup, LOG_FILE_MAX_SIZE)?)
        }
        None => Box::new(Stderr::new()),
    };

    let filters = parse_log_filters(&config.filter);

    if filters.is_empty() {
        let base_log = LogBuilder::new()
            .output(output)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to initialize logger: {:?}", e))?;

        let _drain = MultiLogBuilder::new()
            .level_filter(log_level)
            .default(base_log)
            .build()
            .start();
    } else {
        let logger = FilteredLogger {
            output: Mutex::new(output),
            max_level: log_level,
            filters,
        };

        log::set_boxed_logger(Box::new(logger)).context("failed to set logger")?;
        log::set_max_level(log_level);
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli)?;

    init_logging(&config.log)?;

    if !config.output.quiet {
        let bench = &config.benchmark;
        println!("LLM Context Benchmark");
        println!("   Config: {}", cli.config.display());
        println!("   Target: {}", config.endpoint.base_url);
        println!("   Context sizes: {}", bench.context_sizes.join(", "));
        println!(
            "   Requests per size: {}  Concurrency: {}  Output tokens: {}",
            bench.requests_per_size, bench.concurrency, bench.output_tokens
        );
        println!("   Request timeout: {}s", bench.request_timeout);
        println!();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run_benchmark(config))
}

async fn run_benchmark(config: Config) -> Result<()> {
    if let Some(admin) = &config.admin
        && admin.enabled
    {
        let addr: SocketAddr = admin
            .listen
            .parse()
            .with_context(|| format!("invalid admin listen address '{}'", admin.listen))?;
        tokio::spawn(llm_context_bench::admin::start_server(addr));
    }

    // Unknown labels are rejected before anything is sent.
    let catalog = ContextCatalog::builtin().with_files(&config.templates)?;
    let templates = catalog.resolve(&config.benchmark.context_sizes)?;

    let endpoint = &config.endpoint;
    let api_key = endpoint.api_key.as_deref();

    if endpoint.health_check_timeout > 0 {
        client::check_server_ready(
            &endpoint.base_url,
            api_key,
            Duration::from_secs(endpoint.health_check_timeout),
            Duration::from_secs(endpoint.health_check_interval),
        )
        .await?;
    }

    let model = match &endpoint.model {
        Some(model) => model.clone(),
        None => {
            info!("Model not specified, querying server for available models");
            client::detect_model(&endpoint.base_url, api_key, Duration::from_secs(10)).await?
        }
    };

    let estimator = TokenEstimator::new(&model, config.benchmark.tokenizer);
    debug!("Token estimator encoding: {:?}", estimator.encoding());

    let chat: Arc<dyn ChatEndpoint> = Arc::new(OpenAIClient::new(ClientConfig {
        base_url: endpoint.base_url.clone(),
        api_key: endpoint.api_key.clone(),
        model: model.clone(),
        connect_timeout: Duration::from_secs(endpoint.timeout),
        pool_size: config.benchmark.concurrency,
    })?);

    if !config.benchmark.skip_stream_check {
        match client::check_stream(chat.as_ref()).await {
            Ok(check) => info!(
                "Stream check ok: {} chunks, {} chars of content",
                check.chunks,
                check.content.chars().count()
            ),
            Err(e) => warn!("Stream check failed, continuing anyway: {:#}", e),
        }
    }

    let driver = RequestDriver::new(
        chat,
        StreamConsumer::new(estimator),
        config.benchmark.output_tokens,
        config.benchmark.request_timeout(),
    );
    let plan = BenchmarkPlan {
        templates,
        requests_per_size: config.benchmark.requests_per_size,
        concurrency: config.benchmark.concurrency,
        inter_request_delay: config.benchmark.inter_request_delay(),
    };

    let mut runner = BenchmarkRunner::new(
        Arc::new(driver),
        Arc::new(catalog),
        config.benchmark.seed,
    );
    let mut progress = ConsoleProgress::new(config.output.quiet);

    info!("Starting benchmark run against {}", model);
    let run = runner.run(&plan, &mut progress).await;
    match &run.status {
        RunStatus::Completed => info!("Benchmark completed"),
        RunStatus::AbortedAt(label) => warn!("Benchmark stopped at context size {}", label),
    }

    let files = ReportFiles::create(&config.output.directory, Utc::now())?;
    files.write_results(&run.groups)?;
    info!("Raw results written to {}", files.results.display());

    let summaries = summarize(&run.groups);
    if !config.output.quiet {
        report::print_summary(&model, &summaries, &run.status);
    }

    files.write_summary(&summaries)?;
    info!("Summary written to {}", files.summary.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, MetadataBuilder};

    #[test]
    fn test_parse_log_filters_skips_bad_entries() {
        let filters = parse_log_filters(&[
            "hyper=warn".to_string(),
            "h2 = off".to_string(),
            "reqwest".to_string(),
            "warp=loud".to_string(),
        ]);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters["hyper"], LevelFilter::Warn);
        assert_eq!(filters["h2"], LevelFilter::Off);
    }

    fn meta(target: &str) -> Metadata<'_> {
        MetadataBuilder::new()
            .target(target)
            .level(Level::Debug)
            .build()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let filters = parse_log_filters(&[
            "hyper=warn".to_string(),
            "hyper::proto=debug".to_string(),
        ]);

        assert!(should_log(&meta("hyper::proto::h1"), &filters));
        assert!(!should_log(&meta("hyper::client"), &filters));
        assert!(should_log(&meta("llm_context_bench::request"), &filters));
    }
}
