use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::analysis::{PerformanceAnalysis, SummaryRecord, mean};
use crate::benchmark::{BenchmarkPlan, Progress, RunStatus};
use crate::outcome::{RequestOutcome, ResultGroup};
use crate::templates::ContextTemplate;

/// Print with timestamp prefix
macro_rules! output {
    () => {
        let now = chrono::Utc::now();
        println!("{}", now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false));
    };
    ($($arg:tt)*) => {{
        let now = chrono::Utc::now();
        print!("{} ", now.to_rfc3339_opts(chrono::SecondsFormat::Millis, false));
        println!($($arg)*);
    }};
}

/// Live progress on stdout while the benchmark runs.
pub struct ConsoleProgress {
    quiet: bool,
    concurrency: usize,
}

impl ConsoleProgress {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            concurrency: 1,
        }
    }
}

impl Progress for ConsoleProgress {
    fn group_started(&mut self, template: &ContextTemplate, plan: &BenchmarkPlan) {
        self.concurrency = plan.concurrency;
        if self.quiet {
            return;
        }

        output!();
        output!(
            "Context size: {} Chars: {} Concurrency: {}",
            template.label,
            thousands(template.char_count()),
            plan.concurrency
        );
        if plan.concurrency > 1 {
            output!("  Launching {} requests", plan.requests_per_size);
        }
    }

    fn request_finished(&mut self, outcome: &RequestOutcome, index: usize, total: usize) {
        if self.quiet || self.concurrency > 1 {
            return;
        }

        if let Some(metrics) = &outcome.metrics {
            output!(
                "  Request {}/{} ok - Latency: {:.2}s Gen TPS: {:.1} TTFT: {}{}",
                index + 1,
                total,
                metrics.elapsed_time,
                metrics.generation_throughput,
                seconds(metrics.ttft),
                if metrics.partial { " (partial)" } else { "" }
            );
        } else if let Some(failure) = &outcome.failure {
            output!("  Request {}/{} failed - {}", index + 1, total, failure.error);
        }
    }

    fn group_finished(&mut self, group: &ResultGroup, elapsed: Duration) {
        if self.quiet {
            return;
        }

        if group.concurrency > 1 {
            let successes: Vec<_> = group.successes().map(|(_, m)| m).collect();
            output!(
                "  Batch done - Time: {:.2}s Succeeded: {}/{}",
                elapsed.as_secs_f64(),
                successes.len(),
                group.results.len()
            );
            if !successes.is_empty() {
                let ttfts: Vec<f64> = successes.iter().filter_map(|m| m.ttft).collect();
                let generation: Vec<f64> =
                    successes.iter().map(|m| m.generation_throughput).collect();
                let prompt: Vec<f64> = successes
                    .iter()
                    .map(|m| m.prompt_throughput)
                    .filter(|tps| *tps > 0.0)
                    .collect();
                output!(
                    "  Averages - TTFT: {} Gen TPS: {} Prompt TPS: {}",
                    seconds(mean(&ttfts)),
                    fixed(mean(&generation), 1),
                    fixed(mean(&prompt), 1)
                );
            }
        }

        if group.is_aborted() {
            output!(
                "  {} request(s) failed, stopping after context size {}",
                group.failure_count(),
                group.context_size
            );
        }
    }
}

/// Prints the run header, the per-size table and the performance highlights.
pub fn print_summary(model: &str, summaries: &[SummaryRecord], status: &RunStatus) {
    output!();
    output!("-----");
    output!("Context Benchmark Complete");
    output!("Model: {}", model);
    if let RunStatus::AbortedAt(label) = status {
        output!("Stopped early at context size {}", label);
        output!(
            "Completed sizes: {}",
            summaries
                .iter()
                .map(|s| s.context_size.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    output!();
    for line in format_table(summaries) {
        output!("{}", line);
    }

    if let Some(analysis) = PerformanceAnalysis::from_summaries(summaries) {
        output!();
        output!("Performance:");
        for line in format_analysis(&analysis) {
            output!("{}", line);
        }
    }
    println!();
}

fn format_table(summaries: &[SummaryRecord]) -> Vec<String> {
    let mut lines = vec![format!(
        "{:<8} {:>6} {:>10} {:>8} {:>12} {:>9} {:>11} {:>12} {:>12} {:>12}",
        "Size",
        "Conc",
        "Chars",
        "Success",
        "Latency(s)",
        "Gen TPS",
        "Prompt TPS",
        "Min TTFT(s)",
        "Max TTFT(s)",
        "Avg TTFT(s)"
    )];

    for s in summaries {
        lines.push(format!(
            "{:<8} {:>6} {:>10} {:>8} {:>12} {:>9} {:>11} {:>12} {:>12} {:>12}",
            s.context_size,
            s.concurrency,
            thousands(s.context_chars),
            format!("{:.1}%", s.success_rate),
            fixed(s.avg_latency, 3),
            fixed(s.avg_generation_tps, 1),
            fixed(s.avg_prompt_tps, 1),
            fixed(s.min_ttft, 3),
            fixed(s.max_ttft, 3),
            fixed(s.avg_ttft, 3)
        ));
    }

    lines
}

fn format_analysis(analysis: &PerformanceAnalysis) -> Vec<String> {
    let mut lines = vec![
        format!(
            "  Lowest latency: {} ({:.3}s)",
            analysis.lowest_latency.0, analysis.lowest_latency.1
        ),
        format!(
            "  Highest latency: {} ({:.3}s)",
            analysis.highest_latency.0, analysis.highest_latency.1
        ),
        format!(
            "  Best generation TPS: {} ({:.1} tokens/s)",
            analysis.best_generation_tps.0, analysis.best_generation_tps.1
        ),
    ];
    if let Some((label, ttft)) = &analysis.best_ttft {
        lines.push(format!("  Best TTFT: {} ({:.3}s)", label, ttft));
    }
    if let Some(growth) = analysis.latency_growth {
        lines.push(format!(
            "  Latency growth: {:.1}% (lowest to highest)",
            growth
        ));
    }
    lines
}

/// Paths of the files written for one run, both stamped with the same time.
#[derive(Debug, Clone)]
pub struct ReportFiles {
    pub results: PathBuf,
    pub summary: PathBuf,
}

impl ReportFiles {
    /// Creates `directory` if needed. Nothing is written yet.
    pub fn create(directory: &Path, timestamp: DateTime<Utc>) -> Result<Self> {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("failed to create {}", directory.display()))?;

        let stamp = timestamp.format("%Y%m%d_%H%M%S");
        Ok(Self {
            results: directory.join(format!("context_benchmark_results_{}.json", stamp)),
            summary: directory.join(format!("context_benchmark_summary_{}.json", stamp)),
        })
    }

    /// Raw groups go out before any analysis runs.
    pub fn write_results(&self, groups: &[ResultGroup]) -> Result<()> {
        write_json(&self.results, groups)
    }

    pub fn write_summary(&self, summaries: &[SummaryRecord]) -> Result<()> {
        write_json(&self.summary, summaries)
    }
}

// Written through a temp file in the same directory so a partial file is
// never left under the final name.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = NamedTempFile::new_in(directory)?;

    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.flush()?;

    file.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn fixed(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(value) => format!("{:.*}", precision, value),
        None => "N/A".to_string(),
    }
}

fn seconds(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{:.3}s", value),
        None => "N/A".to_string(),
    }
}

fn thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
