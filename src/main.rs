use anyhow::{Context, Result, anyhow};
use log::{LevelFilter, Metadata, Record, debug, info};
use ringlog::{Drain, File, LogBuilder, MultiLogBuilder, Output, Stderr};
use serving_bench::{BenchmarkRunner, Cli, Config};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Maximum log file size before rotation (10MB)
const LOG_FILE_MAX_SIZE: u64 = 1024 * 1024 * 10;

/// Parse log filter strings like "hyper=info" into a map of module prefix to level filter
fn parse_log_filters(filters: &[String]) -> HashMap<String, LevelFilter> {
    let mut map = HashMap::new();
    for filter in filters {
        if let Some((module, level)) = filter.split_once('=') {
            let level_filter = match level.to_lowercase().as_str() {
                "error" => LevelFilter::Error,
                "warn" => LevelFilter::Warn,
                "info" => LevelFilter::Info,
                "debug" => LevelFilter::Debug,
                "trace" => LevelFilter::Trace,
                "off" => LevelFilter::Off,
                _ => continue,
            };
            map.insert(module.to_string(), level_filter);
        }
    }
    map
}

/// Longest matching module prefix decides; unmatched targets fall through to the global level.
fn should_log(metadata: &Metadata, filters: &HashMap<String, LevelFilter>) -> bool {
    let target = metadata.target();

    filters
        .iter()
        .filter(|(prefix, _)| target.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
        .is_none_or(|(_, level)| metadata.level() <= *level)
}

/// Logger with per-module filtering that writes through a ringlog output
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
            let message = format!("{} {}\n", record.level(), record.args());
            let _ = output.write_all(message.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut output) = self.output.lock() {
            let _ = output.flush();
        }
    }
}

/// Handle on the ringlog drain shared by the background flush thread and `main`.
#[derive(Clone)]
struct LogFlusher {
    drain: Arc<Mutex<Box<dyn Drain>>>,
}

impl LogFlusher {
    fn new(drain: Box<dyn Drain>) -> Self {
        Self {
            drain: Arc::new(Mutex::new(drain)),
        }
    }

    fn flush(&self) {
        if let Ok(mut drain) = self.drain.lock() {
            let _ = drain.flush();
        }
    }
}

/// Installs the global logger. Returns the drain handle when records are
/// buffered by ringlog and must be flushed before exit.
fn setup_logging(config: &Config) -> Result<Option<LogFlusher>> {
    let log_level = config.log.level.to_level_filter();

    let output: Box<dyn Output> = if let Some(ref log_file) = config.output.trace_log {
        let backup_file = log_file.with_extension("old");
        Box::new(File::new(log_file.clone(), backup_file, LOG_FILE_MAX_SIZE)?)
    } else {
        Box::new(Stderr::new())
    };

    let filters = parse_log_filters(&config.log.filter);

    if filters.is_empty() {
        let base_log = LogBuilder::new()
            .output(output)
            .build()
            .map_err(|e| anyhow!("failed to initialize logger: {:?}", e))?;

        let drain = MultiLogBuilder::new()
            .level_filter(log_level)
            .default(base_log)
            .build()
            .start();
        let flusher = LogFlusher::new(drain);

        let background = flusher.clone();
        std::thread::Builder::new()
            .name("log-drain".to_string())
            .spawn(move || {
                loop {
                    background.flush();
                    std::thread::sleep(Duration::from_millis(100));
                }
            })
            .context("failed to start log drain thread")?;

        Ok(Some(flusher))
    } else {
        let logger = FilteredLogger {
            output: Mutex::new(output),
            max_level: log_level,
            filters,
        };

        log::set_boxed_logger(Box::new(logger)).context("failed to set logger")?;
        log::set_max_level(log_level);

        Ok(None)
    }
}

fn print_banner(config: &Config) {
    println!("Serving Benchmark");
    println!("   Target: {}", config.base_url());
    println!(
        "   Model: {}",
        config.endpoint.model.as_deref().unwrap_or("(auto-detect)")
    );
    println!("   Dataset: {}", config.input.dataset.display());
    println!(
        "   Requests: {} ({} workers, rate {})",
        config.load.num_prompts, config.load.concurrency, config.load.request_rate
    );
    println!();
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let config = cli.into_config()?;

    let log_flusher = setup_logging(&config)?;

    let json_to_stdout = config.output.format == serving_bench::config::OutputFormat::Json
        && config.output.file.is_none();
    if !config.output.quiet && !json_to_stdout {
        print_banner(&config);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .enable_all()
        .build()?;

    let result = runtime.block_on(run_benchmark(config));
    log::logger().flush();
    if let Some(flusher) = log_flusher {
        flusher.flush();
    }
    result
}

async fn run_benchmark(config: Config) -> Result<()> {
    if let Some(ref admin_config) = config.admin
        && admin_config.enabled
    {
        let addr: std::net::SocketAddr = admin_config
            .listen
            .parse()
            .with_context(|| format!("invalid admin listen address {}", admin_config.listen))?;

        tokio::spawn(serving_bench::admin::start_server(addr));
    }

    debug!("Initializing benchmark runner");
    let runner = BenchmarkRunner::new(config).await?;
    runner.run().await?;
    info!("Benchmark completed successfully");
    Ok(())
}
