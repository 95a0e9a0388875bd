//! Per-context-size statistics over finished result groups.

use serde::Serialize;

use crate::outcome::ResultGroup;

/// Statistics for one context size. Every statistic is `None` when the group
/// has no sample for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRecord {
    pub context_size: String,
    pub concurrency: usize,
    /// Percentage of requests that succeeded, 0 to 100
    pub success_rate: f64,
    pub avg_latency: Option<f64>,
    pub p95_latency: Option<f64>,
    pub avg_generation_tps: Option<f64>,
    pub p95_generation_tps: Option<f64>,
    pub avg_prompt_tps: Option<f64>,
    pub p95_prompt_tps: Option<f64>,
    pub avg_ttft: Option<f64>,
    pub p95_ttft: Option<f64>,
    pub min_ttft: Option<f64>,
    pub max_ttft: Option<f64>,
    pub context_chars: usize,
    pub prompt_chars: usize,
    pub prompt_tokens: u64,
    pub total_requests: usize,
    pub successful_requests: usize,
}

pub fn summarize(groups: &[ResultGroup]) -> Vec<SummaryRecord> {
    groups.iter().map(summarize_group).collect()
}

fn summarize_group(group: &ResultGroup) -> SummaryRecord {
    let total_requests = group.results.len();
    let successes: Vec<_> = group.successes().collect();

    // Reference figures come from the first success, or the first attempt
    // when nothing succeeded.
    let reference = successes
        .first()
        .map(|(outcome, _)| *outcome)
        .or_else(|| group.results.first());
    let (context_chars, prompt_chars, prompt_tokens) = reference
        .map(|r| (r.context_char_count, r.prompt_char_count, r.prompt_tokens_estimate))
        .unwrap_or_default();

    let latencies: Vec<f64> = successes.iter().map(|(_, m)| m.elapsed_time).collect();
    let generation: Vec<f64> = successes
        .iter()
        .map(|(_, m)| m.generation_throughput)
        .collect();
    let prompt: Vec<f64> = successes
        .iter()
        .map(|(_, m)| m.prompt_throughput)
        .filter(|tps| *tps > 0.0)
        .collect();
    let ttfts: Vec<f64> = successes.iter().filter_map(|(_, m)| m.ttft).collect();

    let success_rate = if total_requests == 0 {
        0.0
    } else {
        successes.len() as f64 / total_requests as f64 * 100.0
    };

    SummaryRecord {
        context_size: group.context_size.clone(),
        concurrency: group.concurrency,
        success_rate,
        avg_latency: mean(&latencies),
        p95_latency: percentile(&latencies, 95.0),
        avg_generation_tps: mean(&generation),
        p95_generation_tps: percentile(&generation, 95.0),
        avg_prompt_tps: mean(&prompt),
        p95_prompt_tps: percentile(&prompt, 95.0),
        avg_ttft: mean(&ttfts),
        p95_ttft: percentile(&ttfts, 95.0),
        min_ttft: ttfts.iter().copied().reduce(f64::min),
        max_ttft: ttfts.iter().copied().reduce(f64::max),
        context_chars,
        prompt_chars,
        prompt_tokens,
        total_requests,
        successful_requests: successes.len(),
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Percentile with linear interpolation between closest ranks, where
/// `rank = p / 100 * (n - 1)`.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

/// Highlights across the context sizes that produced latency figures.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceAnalysis {
    pub lowest_latency: (String, f64),
    pub highest_latency: (String, f64),
    pub best_generation_tps: (String, f64),
    pub best_ttft: Option<(String, f64)>,
    /// Growth from lowest to highest average latency, in percent. Only set
    /// when more than one size has a latency.
    pub latency_growth: Option<f64>,
}

impl PerformanceAnalysis {
    pub fn from_summaries(summaries: &[SummaryRecord]) -> Option<Self> {
        let valid: Vec<(&SummaryRecord, f64)> = summaries
            .iter()
            .filter_map(|s| s.avg_latency.map(|latency| (s, latency)))
            .collect();

        // Ties keep the earliest size.
        let mut lowest = *valid.first()?;
        let mut highest = lowest;
        for &(summary, latency) in &valid[1..] {
            if latency < lowest.1 {
                lowest = (summary, latency);
            }
            if latency > highest.1 {
                highest = (summary, latency);
            }
        }

        let mut best_generation = (valid[0].0, valid[0].0.avg_generation_tps.unwrap_or(0.0));
        for &(summary, _) in &valid[1..] {
            let tps = summary.avg_generation_tps.unwrap_or(0.0);
            if tps > best_generation.1 {
                best_generation = (summary, tps);
            }
        }

        let best_ttft = valid
            .iter()
            .filter_map(|(s, _)| s.avg_ttft.map(|ttft| (*s, ttft)))
            .fold(None, |best: Option<(&SummaryRecord, f64)>, candidate| match best {
                Some(best) if best.1 <= candidate.1 => Some(best),
                _ => Some(candidate),
            });

        let latency_growth = if valid.len() > 1 && lowest.1 > 0.0 {
            Some((highest.1 - lowest.1) / lowest.1 * 100.0)
        } else {
            None
        };

        Some(Self {
            lowest_latency: (lowest.0.context_size.clone(), lowest.1),
            highest_latency: (highest.0.context_size.clone(), highest.1),
            best_generation_tps: (best_generation.0.context_size.clone(), best_generation.1),
            best_ttft: best_ttft.map(|(s, ttft)| (s.context_size.clone(), ttft)),
            latency_growth,
        })
    }
}
