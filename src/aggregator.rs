use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;

use crate::client::TransportError;

/// Timing and token lengths of one completed request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub prompt_len: usize,
    pub output_len: usize,
    pub latency: Duration,
}

/// A request that failed while the run kept going.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRequest {
    pub prompt_len: usize,
    pub output_len: usize,
    pub kind: &'static str,
    pub message: String,
}

impl FailedRequest {
    pub fn new(prompt_len: usize, output_len: usize, error: &TransportError) -> Self {
        Self {
            prompt_len,
            output_len,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Collects samples from all workers during a run.
///
/// Appends are mutex-guarded and never held across an await point. Entries
/// keep completion order, which carries no meaning.
#[derive(Debug, Default)]
pub struct LatencyAggregator {
    samples: Mutex<Vec<LatencySample>>,
    failures: Mutex<Vec<FailedRequest>>,
}

/// Statistics over one run.
///
/// Per-token means skip samples whose denominator is zero and report how many
/// were skipped; a mean over no samples is `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub completed: usize,
    pub failed: usize,
    pub total_duration: Duration,
    pub requests_per_second: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub input_tokens_per_second: f64,
    pub output_tokens_per_second: f64,
    pub mean_latency_s: Option<f64>,
    pub mean_latency_per_token_s: Option<f64>,
    pub mean_latency_per_output_token_s: Option<f64>,
    pub per_token_excluded: usize,
    pub per_output_token_excluded: usize,
    pub latency_p50_s: Option<f64>,
    pub latency_p90_s: Option<f64>,
    pub latency_p99_s: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailedRequest>,
}

impl LatencyAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: LatencySample) {
        self.samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sample);
    }

    pub fn record_failure(&self, failure: FailedRequest) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(failure);
    }

    pub fn samples(&self) -> Vec<LatencySample> {
        self.samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn summarize(&self, total_duration: Duration) -> LatencySummary {
        let samples = self.samples();
        let failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let secs = total_duration.as_secs_f64();
        let per_second = |count: f64| if secs > 0.0 { count / secs } else { 0.0 };

        let total_input_tokens: u64 = samples.iter().map(|s| s.prompt_len as u64).sum();
        let total_output_tokens: u64 = samples.iter().map(|s| s.output_len as u64).sum();

        let latencies: Vec<f64> = samples.iter().map(|s| s.latency.as_secs_f64()).collect();

        let (mean_latency_per_token_s, per_token_excluded) =
            mean_per(&samples, |s| s.prompt_len + s.output_len);
        let (mean_latency_per_output_token_s, per_output_token_excluded) =
            mean_per(&samples, |s| s.output_len);

        let mut sorted = latencies.clone();
        sorted.sort_by(f64::total_cmp);

        LatencySummary {
            completed: samples.len(),
            failed: failures.len(),
            total_duration,
            requests_per_second: per_second(samples.len() as f64),
            total_input_tokens,
            total_output_tokens,
            input_tokens_per_second: per_second(total_input_tokens as f64),
            output_tokens_per_second: per_second(total_output_tokens as f64),
            mean_latency_s: mean(&latencies),
            mean_latency_per_token_s,
            mean_latency_per_output_token_s,
            per_token_excluded,
            per_output_token_excluded,
            latency_p50_s: percentile(&sorted, 50.0),
            latency_p90_s: percentile(&sorted, 90.0),
            latency_p99_s: percentile(&sorted, 99.0),
            failures,
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Mean of `latency / tokens(sample)`, skipping samples with zero tokens.
fn mean_per(samples: &[LatencySample], tokens: impl Fn(&LatencySample) -> usize) -> (Option<f64>, usize) {
    let mut excluded = 0;
    let ratios: Vec<f64> = samples
        .iter()
        .filter_map(|sample| match tokens(sample) {
            0 => {
                excluded += 1;
                None
            }
            n => Some(sample.latency.as_secs_f64() / n as f64),
        })
        .collect();
    (mean(&ratios), excluded)
}

/// Nearest-rank percentile over ascending values.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample(prompt_len: usize, output_len: usize, secs: f64) -> LatencySample {
        LatencySample {
            prompt_len,
            output_len,
            latency: Duration::from_secs_f64(secs),
        }
    }

    fn close(actual: Option<f64>, expected: f64) -> bool {
        actual.is_some_and(|a| (a - expected).abs() < 1e-9)
    }

    #[test]
    fn test_summary_statistics() {
        let aggregator = LatencyAggregator::new();
        aggregator.record(sample(10, 5, 1.0));
        aggregator.record(sample(20, 10, 3.0));

        let summary = aggregator.summarize(Duration::from_secs(4));
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 0);
        assert!(close(summary.mean_latency_s, 2.0));
        assert!(close(
            summary.mean_latency_per_token_s,
            (1.0 / 15.0 + 3.0 / 30.0) / 2.0
        ));
        assert!(close(
            summary.mean_latency_per_output_token_s,
            (1.0 / 5.0 + 3.0 / 10.0) / 2.0
        ));
        assert_eq!(summary.total_output_tokens, 15);
        assert_eq!(summary.total_input_tokens, 30);
        assert!((summary.output_tokens_per_second - 15.0 / 4.0).abs() < 1e-9);
        assert!((summary.requests_per_second - 0.5).abs() < 1e-9);
        assert!(close(summary.latency_p50_s, 1.0));
        assert!(close(summary.latency_p99_s, 3.0));
    }

    #[test]
    fn test_zero_output_len_is_excluded() {
        let aggregator = LatencyAggregator::new();
        aggregator.record(sample(10, 0, 2.0));
        aggregator.record(sample(10, 10, 2.0));

        let summary = aggregator.summarize(Duration::from_secs(1));
        assert_eq!(summary.per_output_token_excluded, 1);
        assert_eq!(summary.per_token_excluded, 0);
        assert!(close(summary.mean_latency_per_output_token_s, 0.2));
        assert!(close(summary.mean_latency_per_token_s, (2.0 / 10.0 + 2.0 / 20.0) / 2.0));
        // The request itself still counts toward latency and throughput.
        assert!(close(summary.mean_latency_s, 2.0));
        assert_eq!(summary.completed, 2);
    }

    #[test]
    fn test_only_empty_samples_yield_none() {
        let aggregator = LatencyAggregator::new();
        aggregator.record(sample(0, 0, 1.0));

        let summary = aggregator.summarize(Duration::from_secs(1));
        assert_eq!(summary.mean_latency_per_token_s, None);
        assert_eq!(summary.mean_latency_per_output_token_s, None);
        assert_eq!(summary.per_token_excluded, 1);
        assert_eq!(summary.per_output_token_excluded, 1);
        assert!(close(summary.mean_latency_s, 1.0));
    }

    #[test]
    fn test_empty_run_and_zero_duration() {
        let summary = LatencyAggregator::new().summarize(Duration::ZERO);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.mean_latency_s, None);
        assert_eq!(summary.latency_p50_s, None);
        assert_eq!(summary.requests_per_second, 0.0);
        assert_eq!(summary.output_tokens_per_second, 0.0);
    }

    #[test]
    fn test_failures_are_counted_not_averaged() {
        let aggregator = LatencyAggregator::new();
        aggregator.record(sample(10, 10, 1.0));
        aggregator.record_failure(FailedRequest::new(
            10,
            10,
            &TransportError::Timeout(Duration::from_secs(600)),
        ));

        let summary = aggregator.summarize(Duration::from_secs(2));
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].kind, "timeout");
        assert_eq!(summary.total_output_tokens, 10);
        assert!(close(summary.mean_latency_s, 1.0));
    }

    #[test]
    fn test_concurrent_record() {
        let aggregator = Arc::new(LatencyAggregator::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        aggregator.record(sample(t, i, 0.5));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(aggregator.samples().len(), 2000);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(percentile(&values, 50.0), Some(5.0));
        assert_eq!(percentile(&values, 90.0), Some(9.0));
        assert_eq!(percentile(&values, 99.0), Some(10.0));
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&[], 50.0), None);
    }
}
