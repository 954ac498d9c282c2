use log::info;
use metriken::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::Filter;

const PERCENTILES: [f64; 5] = [50.0, 90.0, 95.0, 99.0, 99.9];

/// Live values of the metriken registry while a run is in progress.
pub async fn start_server(addr: SocketAddr) {
    info!("Starting metrics server on {}", addr);
    warp::serve(routes()).run(addr).await;
}

fn routes() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let metrics = warp::path!("metrics").and(warp::get()).and_then(prometheus_metrics);
    let metrics_json = warp::path!("metrics.json").and(warp::get()).and_then(json_metrics);
    let vars = warp::path!("vars").and(warp::get()).and_then(human_metrics);
    metrics.or(metrics_json).or(vars)
}

enum Reading {
    Counter(u64),
    Gauge(i64),
    Percentile(f64, u64),
}

struct Sample {
    name: String,
    description: Option<String>,
    reading: Reading,
}

/// Flattens the registry; histograms become one sample per percentile.
fn snapshot() -> Vec<Sample> {
    let mut samples = Vec::new();

    for metric in &metriken::metrics() {
        let name = metric.name().to_string();
        let description = metric.description().map(|d| d.to_string());

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
                    for (percentile, bucket) in values.iter() {
                        samples.push(Sample {
                            name: name.clone(),
                            description: description.clone(),
                            reading: Reading::Percentile(*percentile, bucket.end()),
                        });
                    }
                }
            }
            _ => continue,
        }
    }

    samples
}

fn percentile_key(name: &str, percentile: f64) -> String {
    format!("{}/p{}", name, (percentile * 10.0) as u32)
}

pub fn render_prometheus() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);

    let mut lines: Vec<String> = snapshot()
        .into_iter()
        .map(|sample| {
            let name = sample.name.replace('/', "_");
            let help = sample
                .description
                .map(|d| format!("# HELP {} {}\n", name, d))
                .unwrap_or_default();
            match sample.reading {
                Reading::Counter(value) => {
                    format!("# TYPE {name} counter\n{help}{name} {value} {timestamp}")
                }
                Reading::Gauge(value) => {
                    format!("# TYPE {name} gauge\n{help}{name} {value} {timestamp}")
                }
                Reading::Percentile(percentile, value) => format!(
                    "# TYPE {name} gauge\n{name}{{percentile=\"{percentile}\"}} {value} {timestamp}"
                ),
            }
        })
        .collect();

    lines.sort();
    lines.join("\n") + "\n# EOF\n"
}

pub fn render_json() -> serde_json::Map<String, serde_json::Value> {
    snapshot()
        .into_iter()
        .map(|sample| match sample.reading {
            Reading::Counter(value) => (sample.name, serde_json::json!(value)),
            Reading::Gauge(value) => (sample.name, serde_json::json!(value)),
            Reading::Percentile(percentile, value) => (
                percentile_key(&sample.name, percentile),
                serde_json::json!(value),
            ),
        })
        .collect()
}

pub fn render_human() -> String {
    let mut lines: Vec<String> = snapshot()
        .into_iter()
        .map(|sample| match sample.reading {
            Reading::Counter(value) => format!("{}: {}", sample.name, value),
            Reading::Gauge(value) => format!("{}: {}", sample.name, value),
            Reading::Percentile(percentile, value) => {
                format!("{}: {}", percentile_key(&sample.name, percentile), value)
            }
        })
        .collect();

    lines.sort();
    lines.join("\n") + "\n"
}

async fn prometheus_metrics() -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::with_header(
        render_prometheus(),
        "content-type",
        "text/plain; version=0.0.4; charset=utf-8",
    ))
}

async fn json_metrics() -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&render_json()))
}

async fn human_metrics() -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::with_header(
        render_human(),
        "content-type",
        "text/plain; charset=utf-8",
    ))
}
