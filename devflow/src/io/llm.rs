//! LLM client seam and the Anthropic Messages API implementation.

use std::cell::RefCell;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::TokenUsage;
use crate::error::PipelineError;
use crate::io::config::{ApiKey, LlmConfig};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmReply {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
    pub duration_ms: u64,
}

/// Anything that can answer a prompt. Tests substitute scripted replies.
pub trait LlmClient {
    /// Failures are returned as `PipelineError::LlmCall` inside the error chain.
    fn complete(&self, request: &LlmRequest) -> Result<LlmReply>;
}

/// Retry schedule for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based): `initial * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(factor)
    }
}

pub struct AnthropicClient {
    http: Client,
    api_url: String,
    api_key: ApiKey,
    retry: RetryPolicy,
}

impl AnthropicClient {
    pub fn new(config: &LlmConfig, api_key: ApiKey) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|err| PipelineError::LlmCall(format!("build HTTP client: {err}")))?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_key,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                initial_backoff: Duration::from_millis(config.retry_backoff_ms),
            },
        })
    }

    fn send_once(&self, body: &MessagesRequest<'_>) -> Result<MessagesResponse, CallFailure> {
        let response = self
            .http
            .post(&self.api_url)
            .header("x-api-key", self.api_key.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .map_err(|err| CallFailure {
                transient: err.is_timeout() || err.is_connect(),
                message: format!("request failed: {err}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(CallFailure {
                transient: is_transient_status(status),
                message: format!("API error ({status}): {}", text.trim()),
            });
        }
        response.json::<MessagesResponse>().map_err(|err| CallFailure {
            transient: false,
            message: format!("invalid response body: {err}"),
        })
    }
}

struct CallFailure {
    transient: bool,
    message: String,
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

impl LlmClient for AnthropicClient {
    #[instrument(skip_all, fields(model = %request.model, prompt_chars = request.prompt.len()))]
    fn complete(&self, request: &LlmRequest) -> Result<LlmReply> {
        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: (!request.system.is_empty()).then_some(request.system.as_str()),
            temperature: request.temperature,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let started = Instant::now();
        let mut attempt = 0u32;
        let response = loop {
            match self.send_once(&body) {
                Ok(response) => break response,
                Err(failure) if failure.transient && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %failure.message,
                        "transient LLM failure, retrying"
                    );
                    thread::sleep(backoff);
                }
                Err(failure) => {
                    return Err(PipelineError::LlmCall(failure.message).into());
                }
            }
        };

        let text = response
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<String>();
        let reply = LlmReply {
            text,
            model: response.model,
            usage: TokenUsage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
            stop_reason: response.stop_reason,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            input_tokens = reply.usage.input_tokens,
            output_tokens = reply.usage.output_tokens,
            retries = attempt,
            duration_ms = reply.duration_ms,
            "LLM call complete"
        );
        debug!(stop_reason = ?reply.stop_reason, reply_chars = reply.text.len(), "LLM reply");
        Ok(reply)
    }
}

/// Builds the Anthropic client on the first call, reading the API key then.
///
/// Task and project problems are therefore reported before a key is ever
/// needed, and a missing key halts the run as an `LlmCall` failure with a
/// report instead of aborting the process.
pub struct DeferredAnthropicClient {
    config: LlmConfig,
    env_file: PathBuf,
    client: RefCell<Option<AnthropicClient>>,
}

impl DeferredAnthropicClient {
    pub fn new(config: &LlmConfig, env_file: impl Into<PathBuf>) -> Self {
        Self {
            config: config.clone(),
            env_file: env_file.into(),
            client: RefCell::new(None),
        }
    }

    fn build(&self) -> Result<AnthropicClient> {
        let key = ApiKey::from_env(&self.env_file)
            .map_err(|err| PipelineError::LlmCall(format!("{err:#}")))?;
        AnthropicClient::new(&self.config, key)
    }
}

impl LlmClient for DeferredAnthropicClient {
    fn complete(&self, request: &LlmRequest) -> Result<LlmReply> {
        let mut slot = self.client.borrow_mut();
        if let Some(client) = slot.as_ref() {
            return client.complete(request);
        }
        let client = slot.insert(self.build()?);
        debug!("anthropic client ready");
        client.complete(request)
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_initial() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    /// Verifies a missing key surfaces from `complete` as `LlmCall`, not
    /// from construction.
    #[test]
    fn deferred_client_reports_missing_key_as_llm_call() {
        if std::env::var("ANTHROPIC_API_KEY").is_ok() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let client = DeferredAnthropicClient::new(&LlmConfig::default(), temp.path().join(".env"));
        let request = LlmRequest {
            model: "m".to_string(),
            system: String::new(),
            prompt: "hi".to_string(),
            max_tokens: 16,
            temperature: None,
        };
        let err = client.complete(&request).expect_err("no key");
        let typed = crate::error::find_pipeline_error(&err).expect("typed");
        assert_eq!(typed.kind(), "LlmCall");
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn only_rate_limits_and_server_errors_are_transient() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
    }
}
