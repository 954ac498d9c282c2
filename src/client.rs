use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::aggregator::LatencySample;
use crate::dataset::Request;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP {status} client error: {message}")]
    Http4xx { status: u16, message: String },

    #[error("HTTP {status} server error: {message}")]
    Http5xx { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Other error: {0}")]
    Other(String),
}

impl TransportError {
    /// Short label used in reports and failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Connection(_) => "connection",
            TransportError::Http4xx { .. } => "http_4xx",
            TransportError::Http5xx { .. } => "http_5xx",
            TransportError::Parse(_) => "parse",
            TransportError::Timeout(_) => "timeout",
            TransportError::Other(_) => "other",
        }
    }
}

/// One request/response cycle against the target server.
///
/// Implementations measure the wall-clock time of the full cycle and return it
/// together with the request's token lengths.
#[async_trait]
pub trait RequestTransport: Send + Sync + 'static {
    async fn send(&self, request: &Request) -> Result<LatencySample, TransportError>;
}

#[derive(Debug, Clone)]
pub struct OpenAIClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

// Request types for OpenAI Chat Completions API
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

// Response types
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: Option<Message>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// Models list response
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<Model>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub owned_by: String,
}

/// Configuration for creating an OpenAI client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the OpenAI-compatible API endpoint
    pub base_url: String,
    /// Optional API key for authentication
    pub api_key: Option<String>,
    /// Model name to use for requests
    pub model: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Connection pool size (should match concurrency)
    pub pool_size: usize,
}

impl OpenAIClient {
    /// Creates a client with connection pooling sized to the worker count.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use serving_bench::client::{OpenAIClient, ClientConfig};
    /// use std::time::Duration;
    ///
    /// let config = ClientConfig {
    ///     base_url: "http://localhost:9997/v1".to_string(),
    ///     api_key: None,
    ///     model: "qwen2.5-instruct".to_string(),
    ///     timeout: Duration::from_secs(600),
    ///     pool_size: 100,
    /// };
    ///
    /// let client = OpenAIClient::new(config).unwrap();
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_size)
            .pool_idle_timeout(Duration::from_secs(300))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            model: config.model,
            timeout: config.timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn create_request(&self, prompt: &str, max_tokens: usize) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: u32::try_from(max_tokens).unwrap_or(u32::MAX),
            stream: false,
        }
    }

    pub async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, TransportError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req = self.client.post(&url).json(request);

        if let Some(api_key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());

            return Err(if status.is_client_error() {
                TransportError::Http4xx {
                    status: status_code,
                    message: text,
                }
            } else if status.is_server_error() {
                TransportError::Http5xx {
                    status: status_code,
                    message: text,
                }
            } else {
                TransportError::Other(format!("HTTP {}: {}", status_code, text))
            });
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice::<ChatCompletionResponse>(&body)
            .map_err(|e| TransportError::Parse(e.to_string()))
    }

    fn classify(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if e.is_connect() {
            TransportError::Connection(e.to_string())
        } else if e.is_request() {
            let err_msg = e.to_string();
            if err_msg.contains("connection closed")
                || err_msg.contains("connection reset")
                || err_msg.contains("broken pipe")
                || err_msg.contains("connection refused")
            {
                TransportError::Connection(format!("Request error: {}", e))
            } else {
                TransportError::Other(format!("Request error: {}", e))
            }
        } else if e.is_decode() || e.is_body() {
            TransportError::Parse(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

#[async_trait]
impl RequestTransport for OpenAIClient {
    async fn send(&self, request: &Request) -> Result<LatencySample, TransportError> {
        let body = self.create_request(&request.prompt, request.output_len);

        let start = Instant::now();
        let response = self.chat_completion(&body).await?;
        let latency = start.elapsed();

        if let Some(usage) = &response.usage {
            log::trace!(
                "Response {} usage: prompt={} completion={} (requested prompt_len={} output_len={})",
                response.id,
                usage.prompt_tokens,
                usage.completion_tokens,
                request.prompt_len,
                request.output_len
            );
        }

        Ok(LatencySample {
            prompt_len: request.prompt_len,
            output_len: request.output_len,
            latency,
        })
    }
}

/// Wait for server to become ready by polling the /v1/models endpoint
///
/// Success means the server is ready to serve requests, not just alive.
///
/// # Arguments
///
/// * `base_url` - The base URL of the server (e.g., "http://localhost:9997/v1")
/// * `api_key` - Optional API key for authentication
/// * `total_timeout` - Maximum time to wait for server to be ready
/// * `retry_interval` - Time to wait between attempts
pub async fn check_server_ready(
    base_url: &str,
    api_key: Option<&str>,
    total_timeout: Duration,
    retry_interval: Duration,
) -> Result<()> {
    let start_time = Instant::now();
    let mut attempt = 0;

    log::info!("Waiting for server to be ready at {}...", base_url);

    loop {
        attempt += 1;

        log::debug!("Server readiness check attempt {}: GET {}/models", attempt, base_url);

        match list_models(base_url, api_key, Duration::from_secs(10)).await {
            Ok(models) => {
                log::info!(
                    "Server is ready ({} model{} available after {:.1}s)",
                    models.len(),
                    if models.len() == 1 { "" } else { "s" },
                    start_time.elapsed().as_secs_f64()
                );
                return Ok(());
            }
            Err(e) => {
                log::debug!("Models endpoint returned error: {}", e);
            }
        }

        let remaining = total_timeout.saturating_sub(start_time.elapsed());
        if remaining.is_zero() {
            anyhow::bail!(
                "Server readiness timeout after {:.1}s. Server at {} did not become ready.",
                total_timeout.as_secs_f64(),
                base_url
            );
        }

        tokio::time::sleep(retry_interval.min(remaining)).await;
    }
}

pub async fn list_models(
    base_url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<Vec<Model>> {
    let client = Client::builder().timeout(timeout).build()?;

    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let mut req = client.get(&url);

    if let Some(key) = api_key {
        req = req.header("Authorization", format!("Bearer {}", key));
    }

    let response = req
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query models endpoint: {}", e))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response".to_string());
        anyhow::bail!("Models endpoint returned {}: {}", status, text);
    }

    let models_response: ModelsResponse = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse models response: {}", e))?;

    Ok(models_response.data)
}

/// Picks the first model the server reports.
pub async fn detect_model(
    base_url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<String> {
    let models = list_models(base_url, api_key, timeout).await?;

    let Some(first) = models.first() else {
        anyhow::bail!("No models available from server at {}/models", base_url);
    };

    if models.len() > 1 {
        log::info!("Found {} models, using: {}", models.len(), first.id);
        log::debug!(
            "Available models: {:?}",
            models.iter().map(|m| &m.id).collect::<Vec<_>>()
        );
    } else {
        log::info!("Detected model: {}", first.id);
    }

    Ok(first.id.clone())
}
