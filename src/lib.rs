pub mod admin;
pub mod aggregator;
pub mod backlog;
pub mod benchmark;
pub mod cli;
pub mod client;
pub mod config;
pub mod dataset;
pub mod distribution;
pub mod metrics;
pub mod progress;
pub mod report;
pub mod scheduler;
pub mod tokenizer;
pub mod worker;

pub use aggregator::{FailedRequest, LatencyAggregator, LatencySample, LatencySummary};
pub use backlog::Backlog;
pub use benchmark::{BenchmarkRunner, RunResult, effective_concurrency};
pub use cli::Cli;
pub use client::{
    ChatCompletionRequest, ChatCompletionResponse, ClientConfig, OpenAIClient, RequestTransport,
    TransportError,
};
pub use config::{ArrivalPolicy, Config, ConfigError, FailurePolicy};
pub use dataset::Request;
pub use metrics::Metrics;
pub use report::{BenchmarkReport, ReportBuilder};
pub use scheduler::{ArrivalScheduler, ReleaseStats};
pub use tokenizer::Tokenizer;
