use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::config::{ArrivalPolicy, Config, FailurePolicy, LogLevel, OutputFormat};

/// Command line flags.
///
/// Every flag is optional so that a `--config` file can supply it; a flag given
/// on the command line always wins over the file.
#[derive(Parser, Debug)]
#[command(name = "serving-bench")]
#[command(author, version, about = "Benchmark online serving throughput of OpenAI-compatible chat endpoints", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Target host [default: localhost]
    #[arg(long)]
    pub host: Option<String>,

    /// Target port [default: 9997]
    #[arg(long)]
    pub port: Option<u16>,

    /// Path to a ShareGPT-style dataset
    #[arg(long)]
    pub dataset: Option<PathBuf>,

    /// Tokenizer name (cl100k_base, o200k_base, a Hugging Face id) or path
    #[arg(long)]
    pub tokenizer: Option<String>,

    /// Number of prompts to process [default: 100]
    #[arg(long)]
    pub num_prompts: Option<usize>,

    /// Maximum prompt length in tokens [default: 1024]
    #[arg(long)]
    pub prompt_len_limit: Option<usize>,

    /// Bearer token sent with every request
    #[arg(long)]
    pub api_key: Option<String>,

    /// Number of concurrent workers [default: 100]
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Requests per second, or "inf" to release everything at once [default: inf]
    #[arg(long)]
    pub request_rate: Option<ArrivalPolicy>,

    /// Seed for dataset sampling and arrival times [default: 0]
    #[arg(long)]
    pub seed: Option<u64>,

    /// Accepted for compatibility; tokenizers never run remote code
    #[arg(long)]
    pub trust_remote_code: bool,

    /// Model to request; detected from the server when omitted
    #[arg(long)]
    pub model_uid: Option<String>,

    /// What to do when a request fails [default: fail-fast]
    #[arg(long, value_enum)]
    pub failure_policy: Option<FailurePolicy>,

    /// Per-request timeout in seconds [default: 600]
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Report format [default: console]
    #[arg(long, value_enum)]
    pub output_format: Option<OutputFormat>,

    /// Write the JSON report to this file instead of stdout
    #[arg(long, value_name = "FILE")]
    pub output_file: Option<PathBuf>,

    /// Suppress the banner, progress line and console summary
    #[arg(long)]
    pub quiet: bool,

    /// Log level [default: info]
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Merges the optional config file with the flags and validates the result.
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.endpoint.host = host;
        }
        if let Some(port) = self.port {
            config.endpoint.port = port;
        }
        if self.api_key.is_some() {
            config.endpoint.api_key = self.api_key;
        }
        if self.model_uid.is_some() {
            config.endpoint.model = self.model_uid;
        }
        if let Some(timeout) = self.timeout {
            config.endpoint.timeout = timeout;
        }

        if let Some(num_prompts) = self.num_prompts {
            config.load.num_prompts = num_prompts;
        }
        if let Some(concurrency) = self.concurrency {
            config.load.concurrency = concurrency;
        }
        if let Some(rate) = self.request_rate {
            config.load.request_rate = rate;
        }
        if let Some(seed) = self.seed {
            config.load.seed = seed;
        }
        if let Some(policy) = self.failure_policy {
            config.load.failure_policy = policy;
        }

        if let Some(dataset) = self.dataset {
            config.input.dataset = dataset;
        }
        if let Some(tokenizer) = self.tokenizer {
            config.input.tokenizer = tokenizer;
        }
        if let Some(limit) = self.prompt_len_limit {
            config.input.prompt_len_limit = limit;
        }
        config.input.trust_remote_code |= self.trust_remote_code;

        if let Some(format) = self.output_format {
            config.output.format = format;
        }
        if self.output_file.is_some() {
            config.output.file = self.output_file;
        }
        config.output.quiet |= self.quiet;

        if let Some(level) = self.log_level {
            config.log.level = level;
        }
    }
}
