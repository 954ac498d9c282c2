use anyhow::{Context, Result};
use log::{debug, error, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::aggregator::{LatencyAggregator, LatencySummary};
use crate::backlog::Backlog;
use crate::client::{ClientConfig, OpenAIClient, RequestTransport};
use crate::config::{Config, ConfigError, OutputFormat};
use crate::dataset::{self, Request};
use crate::metrics::Metrics;
use crate::progress::Progress;
use crate::report::{BenchmarkReport, ReportBuilder};
use crate::scheduler::{ArrivalScheduler, ReleaseStats};
use crate::tokenizer::Tokenizer;
use crate::worker::{Completion, Worker};

/// Everything one run produced.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub summary: LatencySummary,
    pub effective_concurrency: usize,
    pub backlog_capacity: usize,
    pub backlog_high_water: usize,
    pub release: ReleaseStats,
}

/// Worker count for a run: never more workers than requests.
pub fn effective_concurrency(requested: usize, total_requests: usize) -> usize {
    requested.min(total_requests)
}

/// Drives one benchmark run against an OpenAI-compatible chat endpoint.
///
/// The runner owns the pre-sampled requests and the transport. A run releases
/// the requests into a bounded backlog according to the arrival policy, lets
/// a fixed pool of workers drain it, and summarises the latency samples once
/// every request has completed.
///
/// # Examples
///
/// ```no_run
/// use serving_bench::{BenchmarkRunner, Config};
/// use std::path::Path;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::load(Path::new("bench.toml"))?;
///     let runner = BenchmarkRunner::new(config).await?;
///     runner.run().await?;
///     Ok(())
/// }
/// ```
pub struct BenchmarkRunner<T: RequestTransport = OpenAIClient> {
    transport: Arc<T>,
    requests: Vec<Request>,
    config: Config,
}

impl BenchmarkRunner<OpenAIClient> {
    /// Prepares a run against the configured server.
    ///
    /// Waits for the server if a readiness timeout is set, resolves the model
    /// (querying `/v1/models` when none is configured), then tokenizes the
    /// dataset and samples the requests with the configured seed.
    pub async fn new(mut config: Config) -> Result<Self> {
        let base_url = config.base_url();

        if config.endpoint.health_check_timeout > 0 {
            crate::client::check_server_ready(
                &base_url,
                config.endpoint.api_key.as_deref(),
                Duration::from_secs(config.endpoint.health_check_timeout),
                Duration::from_secs(config.endpoint.health_check_interval),
            )
            .await?;
        }

        let model = if let Some(model) = config.endpoint.model.clone() {
            model
        } else {
            info!("Model not specified, querying server for available models");
            let detected = crate::client::detect_model(
                &base_url,
                config.endpoint.api_key.as_deref(),
                Duration::from_secs(config.endpoint.timeout),
            )
            .await?;
            config.endpoint.model = Some(detected.clone());
            detected
        };

        let client = OpenAIClient::new(ClientConfig {
            base_url,
            api_key: config.endpoint.api_key.clone(),
            model,
            timeout: Duration::from_secs(config.endpoint.timeout),
            pool_size: effective_concurrency(config.load.concurrency, config.load.num_prompts),
        })?;

        info!("Preparing for benchmark.");
        let input = config.input.clone();
        let num_prompts = config.load.num_prompts;
        let seed = config.load.seed;
        // Tokenizing the whole dataset is CPU bound.
        let requests = tokio::task::spawn_blocking(move || {
            let tokenizer = Tokenizer::load(&input.tokenizer, input.trust_remote_code)?;
            debug!("Using {} tokenizer '{}'", tokenizer.kind(), input.tokenizer);
            let mut rng = StdRng::seed_from_u64(seed);
            dataset::sample_requests(
                &input.dataset,
                &tokenizer,
                num_prompts,
                input.prompt_len_limit,
                &mut rng,
            )
        })
        .await
        .context("request sampling task failed")??;

        debug!("Sampled {} requests", requests.len());
        Ok(Self::with_transport(client, requests, config))
    }
}

impl<T: RequestTransport> BenchmarkRunner<T> {
    /// Builds a runner around any transport and an already sampled request list.
    ///
    /// Only the load and output sections of `config` are consulted.
    pub fn with_transport(transport: T, requests: Vec<Request>, config: Config) -> Self {
        Self {
            transport: Arc::new(transport),
            requests,
            config,
        }
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Executes the run and returns its raw result without printing anything
    /// besides the progress line.
    ///
    /// The arrival policy and worker count are checked before anything is
    /// spawned. Under the fail-fast policy the first transport error cancels
    /// the run and is returned; no summary is produced.
    pub async fn dispatch(&self) -> Result<RunResult> {
        let load = &self.config.load;
        let total = self.requests.len();

        if load.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency.into());
        }
        let scheduler = ArrivalScheduler::new(load.request_rate, load.seed)?;

        let concurrency = effective_concurrency(load.concurrency, total);
        if concurrency < load.concurrency {
            info!("Fix concurrency with num_prompts {}", total);
        }

        let backlog = Backlog::new(concurrency);
        let aggregator = Arc::new(LatencyAggregator::new());
        let completion = Arc::new(Completion::new(total));
        let progress = self.progress();

        info!(
            "Sending {} requests with {} workers, {} arrivals (rate {})",
            total,
            concurrency,
            scheduler.pacing_name(),
            load.request_rate
        );
        Metrics::record_run_start(total);

        let start = Instant::now();

        let mut workers = JoinSet::new();
        for id in 0..concurrency {
            let worker = Worker {
                id,
                transport: Arc::clone(&self.transport),
                backlog: backlog.clone(),
                aggregator: Arc::clone(&aggregator),
                completion: Arc::clone(&completion),
                failure_policy: load.failure_policy,
                progress,
            };
            workers.spawn(worker.run());
        }

        let mut release = tokio::spawn(scheduler.release(
            self.requests.clone(),
            backlog.clone(),
            completion.token(),
        ));
        let mut release_stats: Option<ReleaseStats> = None;
        let mut release_pending = true;

        // The scheduler is watched alongside the workers: if it dies, nothing
        // else would ever feed the backlog.
        let mut failure: Option<anyhow::Error> = None;
        loop {
            let error = tokio::select! {
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(handled))) => {
                        debug!("Worker finished after {} requests", handled);
                        continue;
                    }
                    Some(Ok(Err(e))) => {
                        anyhow::Error::from(e).context("request failed, aborting benchmark")
                    }
                    Some(Err(e)) if e.is_cancelled() => continue,
                    Some(Err(e)) => anyhow::Error::from(e).context("worker task panicked"),
                },
                released = &mut release, if release_pending => {
                    release_pending = false;
                    match released {
                        Ok(stats) => {
                            release_stats = Some(stats);
                            continue;
                        }
                        Err(e) => anyhow::Error::from(e).context("scheduler task failed"),
                    }
                }
            };

            if failure.is_none() {
                completion.abort();
                backlog.close();
                workers.abort_all();
                failure = Some(error);
            } else {
                debug!("Additional error after abort: {:#}", error);
            }
        }

        let total_duration = start.elapsed();
        backlog.close();
        if release_pending {
            match release.await {
                Ok(stats) => release_stats = Some(stats),
                Err(e) if failure.is_none() => {
                    failure = Some(anyhow::Error::from(e).context("scheduler task failed"));
                }
                Err(e) => debug!("Scheduler error after abort: {}", e),
            }
        }
        progress.finish();

        if let Some(error) = failure {
            error!("Benchmark aborted after {:.2}s", total_duration.as_secs_f64());
            return Err(error);
        }

        if !completion.is_complete() {
            anyhow::bail!(
                "workers exited with {} of {} requests outstanding",
                completion.remaining(),
                total
            );
        }

        let release = release_stats.context("scheduler finished without release stats")?;
        info!(
            "Benchmark completed in {:.2}s, released {} requests over {:.2}s",
            total_duration.as_secs_f64(),
            release.released,
            release.span.as_secs_f64()
        );

        Ok(RunResult {
            summary: aggregator.summarize(total_duration),
            effective_concurrency: concurrency,
            backlog_capacity: backlog.capacity(),
            backlog_high_water: backlog.high_water(),
            release,
        })
    }

    /// Executes the run and emits the report per the output configuration.
    pub async fn run(&self) -> Result<BenchmarkReport> {
        let report_builder = ReportBuilder::new().with_config(self.config.clone());
        info!("Benchmark starts.");

        let result = self.dispatch().await?;
        let report = report_builder.build(&result);
        self.generate_report(&report).await?;
        Ok(report)
    }

    fn json_to_stdout(&self) -> bool {
        self.config.output.format == OutputFormat::Json && self.config.output.file.is_none()
    }

    fn progress(&self) -> Progress {
        Progress::new(!self.config.output.quiet && !self.json_to_stdout())
    }

    async fn generate_report(&self, report: &BenchmarkReport) -> Result<()> {
        match self.config.output.format {
            OutputFormat::Console => {
                if !self.config.output.quiet {
                    report.print_console();
                }
            }
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(report)?;

                if let Some(file_path) = &self.config.output.file {
                    tokio::fs::write(file_path, json)
                        .await
                        .with_context(|| format!("writing report to {}", file_path.display()))?;
                    if !self.config.output.quiet {
                        report.print_console();
                        println!("Report written to {}", file_path.display());
                    }
                } else {
                    // Piped output: the JSON document is the only thing on stdout.
                    println!("{}", json);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::LatencySample;
    use crate::client::TransportError;
    use crate::config::{ArrivalPolicy, FailurePolicy};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::Mutex;

    /// Answers every request after a latency derived from its prompt length.
    struct SleepTransport {
        seen: Mutex<Vec<String>>,
    }

    impl SleepTransport {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RequestTransport for SleepTransport {
        async fn send(&self, request: &Request) -> Result<LatencySample, TransportError> {
            let latency = Duration::from_millis(1 + request.prompt_len as u64 % 7);
            tokio::time::sleep(latency).await;
            self.seen.lock().unwrap().push(request.prompt.clone());
            Ok(LatencySample {
                prompt_len: request.prompt_len,
                output_len: request.output_len,
                latency,
            })
        }
    }

    fn requests(n: usize) -> Vec<Request> {
        (0..n).map(|i| Request::new(format!("prompt {i}"), 10 + i, 5)).collect()
    }

    fn config(concurrency: usize, rate: ArrivalPolicy) -> Config {
        let mut config = Config::default();
        config.load.concurrency = concurrency;
        config.load.request_rate = rate;
        config.output.quiet = true;
        config
    }

    #[test]
    fn test_effective_concurrency() {
        assert_eq!(effective_concurrency(50, 10), 10);
        assert_eq!(effective_concurrency(4, 10), 4);
        assert_eq!(effective_concurrency(100, 0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_clamped_to_request_count() {
        let runner = BenchmarkRunner::with_transport(
            SleepTransport::new(),
            requests(10),
            config(50, ArrivalPolicy::Immediate),
        );
        let result = runner.dispatch().await.unwrap();
        assert_eq!(result.effective_concurrency, 10);
        assert_eq!(result.backlog_capacity, 10);
        assert_eq!(result.summary.completed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_request_handled_exactly_once() {
        let runner = BenchmarkRunner::with_transport(
            SleepTransport::new(),
            requests(57),
            config(6, ArrivalPolicy::Immediate),
        );
        let result = runner.dispatch().await.unwrap();
        assert_eq!(result.summary.completed, 57);
        assert_eq!(result.release.released, 57);

        let mut seen = runner.transport.seen.lock().unwrap().clone();
        seen.sort();
        let mut expected: Vec<String> = requests(57).into_iter().map(|r| r.prompt).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_request_list_completes_immediately() {
        let runner = BenchmarkRunner::with_transport(
            SleepTransport::new(),
            Vec::new(),
            config(4, ArrivalPolicy::Poisson { rate: 1.0 }),
        );
        let result = runner.dispatch().await.unwrap();
        assert_eq!(result.summary.completed, 0);
        assert_eq!(result.effective_concurrency, 0);
        assert_eq!(result.summary.total_duration, Duration::ZERO);
        assert_eq!(result.summary.mean_latency_s, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_rate_fails_before_sending() {
        for rate in [0.0, -2.0, f64::NAN, 1e-30] {
            let runner = BenchmarkRunner::with_transport(
                SleepTransport::new(),
                requests(5),
                config(2, ArrivalPolicy::Poisson { rate }),
            );
            let error = runner.dispatch().await.unwrap_err();
            assert!(
                matches!(
                    error.downcast_ref::<ConfigError>(),
                    Some(ConfigError::InvalidRate(_))
                ),
                "rate {rate} should be rejected, got {error:#}"
            );
            assert!(runner.transport.seen.lock().unwrap().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_concurrency_fails_before_sending() {
        let runner = BenchmarkRunner::with_transport(
            SleepTransport::new(),
            requests(5),
            config(0, ArrivalPolicy::Immediate),
        );
        let error = runner.dispatch().await.unwrap_err();
        assert_eq!(
            error.downcast_ref::<ConfigError>(),
            Some(&ConfigError::ZeroConcurrency)
        );
        assert!(runner.transport.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poisson_run_completes() {
        let runner = BenchmarkRunner::with_transport(
            SleepTransport::new(),
            requests(20),
            config(3, ArrivalPolicy::Poisson { rate: 50.0 }),
        );
        let result = runner.dispatch().await.unwrap();
        assert_eq!(result.summary.completed, 20);
        assert!(result.release.span > Duration::ZERO);
        assert!(result.summary.total_duration >= result.release.span);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_policy_keeps_going() {
        struct EveryThirdFails;

        #[async_trait]
        impl RequestTransport for EveryThirdFails {
            async fn send(&self, request: &Request) -> Result<LatencySample, TransportError> {
                if request.prompt_len % 3 == 0 {
                    return Err(TransportError::Http5xx {
                        status: 503,
                        message: "overloaded".to_string(),
                    });
                }
                Ok(LatencySample {
                    prompt_len: request.prompt_len,
                    output_len: request.output_len,
                    latency: Duration::from_millis(100),
                })
            }
        }

        let mut config = config(2, ArrivalPolicy::Immediate);
        config.load.failure_policy = FailurePolicy::Continue;
        // prompt_len runs 10..=18, three of which are multiples of three
        let runner = BenchmarkRunner::with_transport(EveryThirdFails, requests(9), config);
        let result = runner.dispatch().await.unwrap();

        assert_eq!(result.summary.completed, 6);
        assert_eq!(result.summary.failed, 3);
        assert!(result.summary.failures.iter().all(|f| f.kind == "http_5xx"));
        assert_eq!(result.summary.total_output_tokens, 30);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn backlog_never_exceeds_capacity(
            concurrency in 1usize..8,
            count in 1usize..40,
            poisson in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let rate = if poisson {
                ArrivalPolicy::Poisson { rate: 200.0 }
            } else {
                ArrivalPolicy::Immediate
            };
            let mut config = config(concurrency, rate);
            config.load.seed = seed;

            let result = runtime.block_on(async {
                BenchmarkRunner::with_transport(SleepTransport::new(), requests(count), config)
                    .dispatch()
                    .await
                    .unwrap()
            });

            prop_assert_eq!(result.summary.completed, count);
            prop_assert!(result.backlog_high_water >= 1);
            prop_assert!(result.backlog_high_water <= result.backlog_capacity);
            prop_assert_eq!(result.backlog_capacity, concurrency.min(count));
        }
    }
}
