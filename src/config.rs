use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<TemplateConfig>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>, // If not provided, will auto-detect from server
    #[serde(default = "default_timeout")]
    pub timeout: u64, // TCP connect timeout in seconds; request_timeout bounds the rest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub health_check_timeout: u64, // Seconds to wait for /models readiness (0 = disabled)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_context_sizes")]
    pub context_sizes: Vec<String>,
    #[serde(default = "default_requests_per_size")]
    pub requests_per_size: usize,
    #[serde(default = "default_output_tokens")]
    pub output_tokens: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_inter_request_delay_ms")]
    pub inter_request_delay_ms: u64, // Pause between sequential requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub tokenizer: TokenizerMode,
    #[serde(default)]
    pub skip_stream_check: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerMode {
    #[default]
    Auto, // BPE encoding with heuristic fallback
    Heuristic,
}

/// An additional context template read from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub label: String,
    pub path: PathBuf,
    /// Send the text verbatim, without an appended question
    #[serde(default)]
    pub probe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Per-module log level overrides (e.g., ["hyper=info", "h2=warn"])
    #[serde(default)]
    pub filter: Vec<String>,
    /// Write logs to this file, rotated at 10MB, instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            context_sizes: default_context_sizes(),
            requests_per_size: default_requests_per_size(),
            output_tokens: default_output_tokens(),
            request_timeout: default_request_timeout(),
            concurrency: default_concurrency(),
            inter_request_delay_ms: default_inter_request_delay_ms(),
            seed: None,
            tokenizer: TokenizerMode::default(),
            skip_stream_check: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            quiet: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: Vec::new(),
            file: None,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
            enabled: default_admin_enabled(),
        }
    }
}

fn default_timeout() -> u64 {
    120
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_context_sizes() -> Vec<String> {
    crate::templates::BUILTIN_LABELS
        .iter()
        .map(|label| label.to_string())
        .collect()
}

fn default_requests_per_size() -> usize {
    3
}

fn default_output_tokens() -> u32 {
    200
}

fn default_request_timeout() -> u64 {
    120
}

fn default_concurrency() -> usize {
    1
}

fn default_inter_request_delay_ms() -> u64 {
    1000
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_admin_enabled() -> bool {
    true
}

impl BenchmarkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies command line overrides on top of the file configuration.
    pub fn apply_cli(&mut self, cli: &Cli) -> anyhow::Result<()> {
        if let Some(model) = &cli.model {
            self.endpoint.model = Some(model.clone());
        }
        if let Some(sizes) = &cli.context_sizes {
            self.benchmark.context_sizes = sizes
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(n) = cli.num_requests {
            self.benchmark.requests_per_size = n;
        }
        if let Some(n) = cli.output_tokens {
            self.benchmark.output_tokens = n;
        }
        if let Some(secs) = cli.request_timeout {
            self.benchmark.request_timeout = secs;
        }
        if let Some(n) = cli.concurrency {
            self.benchmark.concurrency = n;
        }
        if cli.skip_stream_check {
            self.benchmark.skip_stream_check = true;
        }
        if cli.debug {
            self.log.level = LogLevel::Debug;
        }
        self.validate()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let bench = &self.benchmark;

        if bench.context_sizes.is_empty() {
            anyhow::bail!("context_sizes must list at least one context size");
        }

        if bench.requests_per_size == 0 {
            anyhow::bail!("requests_per_size must be greater than 0");
        }

        if bench.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }

        if bench.output_tokens == 0 {
            anyhow::bail!("output_tokens must be greater than 0");
        }

        if bench.request_timeout == 0 {
            anyhow::bail!("request_timeout must be greater than 0");
        }

        if self.runtime.worker_threads == 0 {
            anyhow::bail!("worker_threads must be greater than 0");
        }

        for template in &self.templates {
            if template.label.trim().is_empty() {
                anyhow::bail!("template label must not be empty ({})", template.path.display());
            }
        }

        // Labels are checked against the catalog by `ContextCatalog::resolve`
        // once extra templates have been read from disk.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(
            r#"
            [endpoint]
            base_url = "http://localhost:8000/v1"
            "#,
        )
        .unwrap();

        assert_eq!(config.benchmark.context_sizes.len(), 10);
        assert_eq!(config.benchmark.context_sizes[0], "13t");
        assert_eq!(config.benchmark.requests_per_size, 3);
        assert_eq!(config.benchmark.output_tokens, 200);
        assert_eq!(config.benchmark.request_timeout(), Duration::from_secs(120));
        assert_eq!(config.benchmark.concurrency, 1);
        assert_eq!(config.benchmark.inter_request_delay(), Duration::from_secs(1));
        assert_eq!(config.benchmark.tokenizer, TokenizerMode::Auto);
        assert_eq!(config.output.directory, PathBuf::from("outputs"));
        assert!(config.admin.is_none());
        assert!(config.templates.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [endpoint]
            base_url = "http://localhost:8000/v1"
            model = "deepseek-r1"
            api_key = "secret"

            [benchmark]
            context_sizes = ["13t", "4k"]
            requests_per_size = 5
            concurrency = 4
            seed = 7
            tokenizer = "heuristic"

            [[templates]]
            label = "256k"
            path = "contexts/256k.txt"

            [log]
            level = "debug"
            filter = ["hyper=warn"]

            [admin]
            listen = "0.0.0.0:9100"
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.model.as_deref(), Some("deepseek-r1"));
        assert_eq!(config.benchmark.context_sizes, vec!["13t", "4k"]);
        assert_eq!(config.benchmark.seed, Some(7));
        assert_eq!(config.benchmark.tokenizer, TokenizerMode::Heuristic);
        assert_eq!(config.templates[0].label, "256k");
        assert!(!config.templates[0].probe);
        assert_eq!(config.log.filter, vec!["hyper=warn"]);
        let admin = config.admin.unwrap();
        assert!(admin.enabled);
        assert_eq!(admin.listen, "0.0.0.0:9100");
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let err = Config::parse(
            r#"
            [endpoint]
            base_url = "http://localhost:8000/v1"

            [benchmark]
            concurrency = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_validation_rejects_empty_sizes() {
        let err = Config::parse(
            r#"
            [endpoint]
            base_url = "http://localhost:8000/v1"

            [benchmark]
            context_sizes = []
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("context_sizes"));
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = Config::parse(
            r#"
            [endpoint]
            base_url = "http://localhost:8000/v1"
            "#,
        )
        .unwrap();

        let cli = Cli {
            config: PathBuf::from("bench.toml"),
            model: Some("qwen".to_string()),
            context_sizes: Some("1k, 2k,".to_string()),
            num_requests: Some(2),
            output_tokens: None,
            request_timeout: Some(30),
            concurrency: Some(8),
            skip_stream_check: true,
            debug: true,
        };
        config.apply_cli(&cli).unwrap();

        assert_eq!(config.endpoint.model.as_deref(), Some("qwen"));
        assert_eq!(config.benchmark.context_sizes, vec!["1k", "2k"]);
        assert_eq!(config.benchmark.requests_per_size, 2);
        assert_eq!(config.benchmark.output_tokens, 200);
        assert_eq!(config.benchmark.request_timeout, 30);
        assert_eq!(config.benchmark.concurrency, 8);
        assert!(config.benchmark.skip_stream_check);
        assert!(matches!(config.log.level, LogLevel::Debug));
    }
}
