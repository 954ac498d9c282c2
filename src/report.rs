use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, SystemTime};

use crate::aggregator::FailedRequest;
use crate::benchmark::RunResult;
use crate::config::Config;

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    // Metadata
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub version: String,

    // Test configuration
    pub configuration: TestConfiguration,

    // Results
    pub summary: Summary,
    pub throughput: ThroughputStats,
    pub latency: LatencyStats,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailedRequest>,
}

/// Run settings echoed into the report. The API key is never included.
#[derive(Debug, Clone, Serialize)]
pub struct TestConfiguration {
    pub endpoint: String,
    pub model: String,
    pub request_rate: String,
    pub concurrency_requested: usize,
    pub concurrency_effective: usize,
    pub num_prompts: usize,
    pub seed: u64,
    pub failure_policy: String,
    pub dataset: String,
    pub tokenizer: String,
    pub prompt_len_limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total_requests: usize,
    pub completed_requests: usize,
    pub failed_requests: usize,
    pub success_rate: f64,
    pub backlog_capacity: usize,
    pub backlog_high_water: usize,
    pub release_span_s: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputStats {
    pub requests_per_second: f64,
    pub input_tokens_per_second: f64,
    pub output_tokens_per_second: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub mean_s: Option<f64>,
    pub mean_per_token_s: Option<f64>,
    pub mean_per_output_token_s: Option<f64>,
    pub per_token_excluded: usize,
    pub per_output_token_excluded: usize,
    pub p50_s: Option<f64>,
    pub p90_s: Option<f64>,
    pub p99_s: Option<f64>,
}

pub struct ReportBuilder {
    start_time: SystemTime,
    config: Option<Config>,
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(&self, result: &RunResult) -> BenchmarkReport {
        let summary = &result.summary;

        let configuration = match &self.config {
            Some(config) => TestConfiguration {
                endpoint: config.base_url(),
                model: config
                    .endpoint
                    .model
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                request_rate: config.load.request_rate.to_string(),
                concurrency_requested: config.load.concurrency,
                concurrency_effective: result.effective_concurrency,
                num_prompts: config.load.num_prompts,
                seed: config.load.seed,
                failure_policy: match config.load.failure_policy {
                    crate::config::FailurePolicy::FailFast => "fail-fast".to_string(),
                    crate::config::FailurePolicy::Continue => "continue".to_string(),
                },
                dataset: config.input.dataset.display().to_string(),
                tokenizer: config.input.tokenizer.clone(),
                prompt_len_limit: config.input.prompt_len_limit,
            },
            None => TestConfiguration {
                endpoint: "unknown".to_string(),
                model: "unknown".to_string(),
                request_rate: "unknown".to_string(),
                concurrency_requested: result.effective_concurrency,
                concurrency_effective: result.effective_concurrency,
                num_prompts: summary.completed + summary.failed,
                seed: 0,
                failure_policy: "unknown".to_string(),
                dataset: "unknown".to_string(),
                tokenizer: "unknown".to_string(),
                prompt_len_limit: 0,
            },
        };

        let total = summary.completed + summary.failed;

        BenchmarkReport {
            timestamp: self.start_time.into(),
            duration: summary.total_duration,
            version: env!("CARGO_PKG_VERSION").to_string(),
            configuration,
            summary: Summary {
                total_requests: total,
                completed_requests: summary.completed,
                failed_requests: summary.failed,
                success_rate: if total > 0 {
                    summary.completed as f64 / total as f64
                } else {
                    0.0
                },
                backlog_capacity: result.backlog_capacity,
                backlog_high_water: result.backlog_high_water,
                release_span_s: result.release.span.as_secs_f64(),
            },
            throughput: ThroughputStats {
                requests_per_second: summary.requests_per_second,
                input_tokens_per_second: summary.input_tokens_per_second,
                output_tokens_per_second: summary.output_tokens_per_second,
                total_input_tokens: summary.total_input_tokens,
                total_output_tokens: summary.total_output_tokens,
            },
            latency: LatencyStats {
                mean_s: summary.mean_latency_s,
                mean_per_token_s: summary.mean_latency_per_token_s,
                mean_per_output_token_s: summary.mean_latency_per_output_token_s,
                per_token_excluded: summary.per_token_excluded,
                per_output_token_excluded: summary.per_output_token_excluded,
                p50_s: summary.latency_p50_s,
                p90_s: summary.latency_p90_s,
                p99_s: summary.latency_p99_s,
            },
            failures: summary.failures.clone(),
        }
    }
}

impl BenchmarkReport {
    /// Summary lines in print order.
    pub fn console_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Total time: {:.2} s", self.duration.as_secs_f64()),
            format!(
                "Throughput: {:.2} requests/s",
                self.throughput.requests_per_second
            ),
            format!("Average latency: {} s", seconds(self.latency.mean_s)),
            format!(
                "Average latency per token: {} s",
                seconds(self.latency.mean_per_token_s)
            ),
            format!(
                "Average latency per output token: {} s",
                seconds(self.latency.mean_per_output_token_s)
            ),
            format!(
                "Throughput: {:.2} tokens/s",
                self.throughput.output_tokens_per_second
            ),
        ];

        if self.summary.failed_requests > 0 {
            lines.push(format!(
                "Failed requests: {} of {}",
                self.summary.failed_requests, self.summary.total_requests
            ));
        }
        if self.latency.per_token_excluded > 0 {
            lines.push(format!(
                "Excluded from per-token latency: {} requests with no tokens",
                self.latency.per_token_excluded
            ));
        }
        if self.latency.per_output_token_excluded > 0 {
            lines.push(format!(
                "Excluded from per-output-token latency: {} requests with no output tokens",
                self.latency.per_output_token_excluded
            ));
        }
        if self.latency.p50_s.is_some() {
            lines.push(format!(
                "Latency percentiles: p50 {} s p90 {} s p99 {} s",
                seconds(self.latency.p50_s),
                seconds(self.latency.p90_s),
                seconds(self.latency.p99_s)
            ));
        }

        lines
    }

    pub fn print_console(&self) {
        for line in self.console_lines() {
            println!("{}", line);
        }
    }
}

fn seconds(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}", v),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{LatencyAggregator, LatencySample};
    use crate::client::TransportError;
    use crate::scheduler::ReleaseStats;

    fn result(aggregator: &LatencyAggregator, secs: u64) -> RunResult {
        RunResult {
            summary: aggregator.summarize(Duration::from_secs(secs)),
            effective_concurrency: 2,
            backlog_capacity: 2,
            backlog_high_water: 2,
            release: ReleaseStats {
                released: aggregator.samples().len(),
                span: Duration::ZERO,
            },
        }
    }

    #[test]
    fn test_console_lines() {
        let aggregator = LatencyAggregator::new();
        for _ in 0..4 {
            aggregator.record(LatencySample {
                prompt_len: 10,
                output_len: 5,
                latency: Duration::from_secs(1),
            });
        }

        let report = ReportBuilder::new().build(&result(&aggregator, 2));
        let lines = report.console_lines();
        assert_eq!(
            &lines[..6],
            &[
                "Total time: 2.00 s",
                "Throughput: 2.00 requests/s",
                "Average latency: 1.00 s",
                "Average latency per token: 0.07 s",
                "Average latency per output token: 0.20 s",
                "Throughput: 10.00 tokens/s",
            ]
        );
        assert_eq!(lines[6], "Latency percentiles: p50 1.00 s p90 1.00 s p99 1.00 s");
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn test_empty_run_prints_not_available() {
        let report = ReportBuilder::new().build(&result(&LatencyAggregator::new(), 0));
        let lines = report.console_lines();
        assert_eq!(lines[2], "Average latency: n/a s");
        assert_eq!(lines[4], "Average latency per output token: n/a s");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_failures_and_exclusions_are_reported() {
        let aggregator = LatencyAggregator::new();
        aggregator.record(LatencySample {
            prompt_len: 10,
            output_len: 0,
            latency: Duration::from_secs(1),
        });
        aggregator.record_failure(FailedRequest::new(
            10,
            10,
            &TransportError::Connection("refused".to_string()),
        ));

        let report = ReportBuilder::new().build(&result(&aggregator, 1));
        let lines = report.console_lines();
        assert!(lines.contains(&"Failed requests: 1 of 2".to_string()));
        assert!(lines.iter().any(|l| l.starts_with("Excluded from per-output-token latency: 1")));
        assert_eq!(report.summary.success_rate, 0.5);
    }

    #[test]
    fn test_json_report_omits_api_key() {
        let mut config = Config::default();
        config.endpoint.api_key = Some("secret-key".to_string());
        config.endpoint.model = Some("qwen2.5-instruct".to_string());

        let aggregator = LatencyAggregator::new();
        aggregator.record(LatencySample {
            prompt_len: 8,
            output_len: 8,
            latency: Duration::from_millis(500),
        });
        let report = ReportBuilder::new()
            .with_config(config)
            .build(&result(&aggregator, 1));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["configuration"]["model"], "qwen2.5-instruct");
        assert_eq!(json["configuration"]["endpoint"], "http://localhost:9997/v1");
        assert_eq!(json["configuration"]["request_rate"], "inf");
        assert_eq!(json["configuration"]["failure_policy"], "fail-fast");
        assert_eq!(json["summary"]["completed_requests"], 1);
        assert!(json.get("failures").is_none());
        assert!(!json.to_string().contains("secret-key"));
    }
}
