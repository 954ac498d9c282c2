use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid request rate {0:?}: expected a positive number of requests/s or \"inf\"")]
    InvalidRate(String),

    #[error("concurrency must be greater than 0")]
    ZeroConcurrency,

    #[error("num_prompts must be greater than 0")]
    ZeroPrompts,

    #[error("{0} must be specified")]
    Missing(&'static str),

    #[error("worker_threads must be greater than 0")]
    ZeroWorkerThreads,

    #[error("endpoint timeout must be greater than 0")]
    ZeroTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub input: InputConfig,
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
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>, // If not provided, will auto-detect from server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64, // Per-request timeout in seconds
    #[serde(default)]
    pub health_check_timeout: u64, // Total time to wait for server readiness in seconds (0 = disabled)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

/// When requests are released into the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "RateValue", into = "RateValue")]
pub enum ArrivalPolicy {
    /// Every request is released at time zero.
    #[default]
    Immediate,
    /// Exponential inter-arrival times with mean `1 / rate` seconds.
    Poisson { rate: f64 },
}

impl ArrivalPolicy {
    pub fn from_rate(rate: f64) -> Result<Self, ConfigError> {
        if rate == f64::INFINITY {
            return Ok(ArrivalPolicy::Immediate);
        }
        let policy = ArrivalPolicy::Poisson { rate };
        policy.check()?;
        Ok(policy)
    }

    /// Rejects a Poisson rate that is not positive and finite, or whose mean
    /// inter-arrival time does not fit in a `Duration`.
    pub fn check(&self) -> Result<(), ConfigError> {
        match *self {
            ArrivalPolicy::Immediate => Ok(()),
            ArrivalPolicy::Poisson { rate }
                if rate.is_finite()
                    && rate > 0.0
                    && Duration::try_from_secs_f64(rate.recip()).is_ok() =>
            {
                Ok(())
            }
            ArrivalPolicy::Poisson { rate } => Err(ConfigError::InvalidRate(rate.to_string())),
        }
    }

    pub fn rate(&self) -> Option<f64> {
        match self {
            ArrivalPolicy::Immediate => None,
            ArrivalPolicy::Poisson { rate } => Some(*rate),
        }
    }
}

impl FromStr for ArrivalPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("inf") || trimmed.eq_ignore_ascii_case("infinity") {
            return Ok(ArrivalPolicy::Immediate);
        }
        let rate: f64 = trimmed
            .parse()
            .map_err(|_| ConfigError::InvalidRate(s.to_string()))?;
        Self::from_rate(rate).map_err(|_| ConfigError::InvalidRate(s.to_string()))
    }
}

impl fmt::Display for ArrivalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrivalPolicy::Immediate => write!(f, "inf"),
            ArrivalPolicy::Poisson { rate } => write!(f, "{}", rate),
        }
    }
}

/// TOML representation of a request rate: a number or the string "inf".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RateValue {
    Number(f64),
    Text(String),
}

impl TryFrom<RateValue> for ArrivalPolicy {
    type Error = ConfigError;

    fn try_from(value: RateValue) -> Result<Self, Self::Error> {
        match value {
            RateValue::Number(rate) => ArrivalPolicy::from_rate(rate),
            RateValue::Text(text) => text.parse(),
        }
    }
}

impl From<ArrivalPolicy> for RateValue {
    fn from(policy: ArrivalPolicy) -> Self {
        match policy {
            ArrivalPolicy::Immediate => RateValue::Text("inf".to_string()),
            ArrivalPolicy::Poisson { rate } => RateValue::Number(rate),
        }
    }
}

/// What a worker does when a request fails at the transport level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort the whole run on the first failed request.
    #[default]
    FailFast,
    /// Record the failure, count the request as done and keep going.
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_num_prompts")]
    pub num_prompts: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub request_rate: ArrivalPolicy,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default)]
    pub dataset: PathBuf,
    #[serde(default)]
    pub tokenizer: String,
    #[serde(default = "default_prompt_len_limit")]
    pub prompt_len_limit: usize,
    #[serde(default)]
    pub trust_remote_code: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub quiet: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_log: Option<PathBuf>,
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
    /// Per-module log level overrides (e.g., ["hyper=info", "reqwest=warn"])
    #[serde(default)]
    pub filter: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Console,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            model: None,
            api_key: None,
            timeout: default_timeout(),
            health_check_timeout: 0,
            health_check_interval: default_health_check_interval(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            num_prompts: default_num_prompts(),
            concurrency: default_concurrency(),
            request_rate: ArrivalPolicy::Immediate,
            seed: 0,
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            dataset: PathBuf::new(),
            tokenizer: String::new(),
            prompt_len_limit: default_prompt_len_limit(),
            trust_remote_code: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            file: None,
            quiet: false,
            trace_log: None,
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
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    9997
}

fn default_timeout() -> u64 {
    600
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_num_prompts() -> usize {
    100
}

fn default_concurrency() -> usize {
    100
}

fn default_prompt_len_limit() -> usize {
    1024
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Console
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

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            load: LoadConfig::default(),
            input: InputConfig::default(),
            output: OutputConfig::default(),
            runtime: RuntimeConfig::default(),
            log: LogConfig::default(),
            admin: None,
        }
    }
}

impl Config {
    /// Reads a TOML file without validating it. Callers layer CLI overrides on
    /// top and validate the merged result.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&contents)?)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.dataset.as_os_str().is_empty() {
            return Err(ConfigError::Missing("dataset"));
        }

        if self.input.tokenizer.trim().is_empty() {
            return Err(ConfigError::Missing("tokenizer"));
        }

        if self.load.num_prompts == 0 {
            return Err(ConfigError::ZeroPrompts);
        }

        if self.load.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        // Deserialization already rejects these; a policy built in code may not have been.
        self.load.request_rate.check()?;

        if self.endpoint.timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        if self.runtime.worker_threads == 0 {
            return Err(ConfigError::ZeroWorkerThreads);
        }

        Ok(())
    }

    /// Base URL of the OpenAI-compatible API, e.g. `http://localhost:9997/v1`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/v1", self.endpoint.host, self.endpoint.port)
    }
}
