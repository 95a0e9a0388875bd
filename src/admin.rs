use log::info;
use metriken::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use warp::Filter;

/// Histogram percentiles exported on every endpoint.
const PERCENTILES: [f64; 5] = [50.0, 90.0, 95.0, 99.0, 99.9];

#[derive(Debug, Clone, PartialEq)]
enum Reading {
    Counter(u64),
    Gauge(i64),
    Percentile { percentile: f64, value: u64 },
}

#[derive(Debug, Clone, PartialEq)]
struct Sample {
    name: String,
    description: Option<String>,
    reading: Reading,
}

impl Sample {
    /// Key used by the JSON and human readable formats, e.g. `ttft/p999`.
    fn key(&self) -> String {
        match self.reading {
            Reading::Percentile { percentile, .. } => {
                format!("{}/p{}", self.name, (percentile * 10.0) as u32)
            }
            _ => self.name.clone(),
        }
    }
}

/// Start the HTTP admin server for metrics
pub async fn start_server(addr: SocketAddr) {
    info!("Starting metrics server on {}", addr);
    warp::serve(routes()).run(addr).await;
}

pub fn routes() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    // GET /metrics - Prometheus text format
    let prometheus = warp::path!("metrics").and(warp::get()).map(|| {
        let body = render_prometheus(&snapshot(), chrono::Utc::now().timestamp_millis());
        warp::reply::with_header(
            body,
            "content-type",
            "text/plain; version=0.0.4; charset=utf-8",
        )
    });

    // GET /metrics.json
    let json = warp::path!("metrics.json")
        .and(warp::get())
        .and_then(json_metrics);

    // GET /vars - human readable
    let vars = warp::path!("vars").and(warp::get()).map(|| {
        warp::reply::with_header(
            render_vars(&snapshot()),
            "content-type",
            "text/plain; charset=utf-8",
        )
    });

    prometheus.or(json).or(vars)
}

async fn json_metrics() -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&render_json(&snapshot())))
}

/// Reads every registered metric. Histograms are flattened into one sample
/// per exported percentile; empty histograms are skipped.
fn snapshot() -> Vec<Sample> {
    let mut samples = Vec::new();

    for metric in &metriken::metrics() {
        let name = metric.name().to_string();
        let description = metric.description().map(str::to_string);

        match metric.value() {
            Some(Value::Counter(value)) => samples.push(Sample {
                name,
                description,
                reading: Reading::Counter(value),
            }),
            Some(Value::Gauge(value)) => samples.push(Sample {
                name,
                description,
                reading: Reading::Gauge(value),
            }),
            Some(Value::Other(other)) => {
                if let Some(histogram) = other.downcast_ref::<metriken::AtomicHistogram>()
                    && let Some(loaded) = histogram.load()
                    && let Ok(Some(values)) = loaded.percentiles(&PERCENTILES)
                {
                    for (percentile, bucket) in values {
                        samples.push(Sample {
                            name: name.clone(),
                            description: description.clone(),
                            reading: Reading::Percentile {
                                percentile,
                                value: bucket.end(),
                            },
                        });
                    }
                }
            }
            _ => continue,
        }
    }

    samples
}

fn render_prometheus(samples: &[Sample], timestamp: i64) -> String {
    let mut lines: Vec<String> = samples
        .iter()
        .map(|sample| {
            let name = sample.name.replace('/', "_");
            let (kind, series, value) = match sample.reading {
                Reading::Counter(value) => ("counter", name.clone(), value.to_string()),
                Reading::Gauge(value) => ("gauge", name.clone(), value.to_string()),
                Reading::Percentile { percentile, value } => (
                    "gauge",
                    format!("{}{{percentile=\"{}\"}}", name, percentile),
                    value.to_string(),
                ),
            };

            let mut text = format!("# TYPE {} {}\n", name, kind);
            if let Some(description) = &sample.description {
                text.push_str(&format!("# HELP {} {}\n", name, description));
            }
            text.push_str(&format!("{} {} {}", series, value, timestamp));
            text
        })
        .collect();

    lines.sort();
    lines.join("\n") + "\n# EOF\n"
}

fn render_json(samples: &[Sample]) -> serde_json::Map<String, serde_json::Value> {
    samples
        .iter()
        .map(|sample| {
            let value = match sample.reading {
                Reading::Counter(value) => serde_json::json!(value),
                Reading::Gauge(value) => serde_json::json!(value),
                Reading::Percentile { value, .. } => serde_json::json!(value),
            };
            (sample.key(), value)
        })
        .collect()
}

fn render_vars(samples: &[Sample]) -> String {
    let mut lines: Vec<String> = samples
        .iter()
        .map(|sample| {
            let value = match sample.reading {
                Reading::Counter(value) => value.to_string(),
                Reading::Gauge(value) => value.to_string(),
                Reading::Percentile { value, .. } => value.to_string(),
            };
            format!("{}: {}", sample.key(), value)
        })
        .collect();

    lines.sort();
    lines.join("\n") + "\n"
}
