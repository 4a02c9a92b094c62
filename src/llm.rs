//! Language-Model Client
//!
//! `LanguageModel` is the seam the pipeline generates SQL through; `OpenAiClient` implements it
//! against an OpenAI-compatible chat completions endpoint.

use crate::config::{OpenAiConfig, Secret};
use crate::error::{GenerationErrorKind, NlSqlError, Result};
use crate::prompt::Prompt;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    static ref SQL_FENCE: Regex = Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` (1-based) failed: doubling from the initial
    /// backoff plus up to 50% jitter, never above `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or `max_attempts` is reached.
/// The last error is returned unchanged.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    "{} attempt {}/{} failed: {}; retrying in {:?}",
                    what, attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            temperature: 0.1,
            max_tokens: 500,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(NlSqlError::Configuration("openai.model is empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(NlSqlError::Configuration(format!(
                "openai.temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(NlSqlError::Configuration(
                "openai.max_tokens must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(NlSqlError::Configuration(
                "openai.request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(NlSqlError::Configuration(
                "openai.max_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub model: String,
    pub prompt_hash: String,
    pub generated_at: DateTime<Utc>,
}

/// Unvalidated SQL text produced by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSql {
    pub sql: String,
    pub provenance: Provenance,
}

impl CandidateSql {
    pub fn new(sql: impl Into<String>, model: &str, prompt: &Prompt) -> Self {
        Self {
            sql: sql.into(),
            provenance: Provenance {
                model: model.to_string(),
                prompt_hash: prompt.hash.clone(),
                generated_at: Utc::now(),
            },
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &Prompt, config: &LlmConfig) -> Result<CandidateSql>;
}

/// Take the body of the first fenced block if there is one, otherwise the whole reply.
pub fn extract_sql(content: &str) -> String {
    match SQL_FENCE.captures(content).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().trim().to_string(),
        None => content.trim().to_string(),
    }
}

pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: Secret,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: Secret, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &OpenAiConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(NlSqlError::Configuration(
                "openai.api_key is not set (config or OPENAI_API_KEY)".to_string(),
            ));
        }
        Ok(Self::new(config.api_key.clone(), config.base_url.clone()))
    }

    async fn complete_once(&self, prompt: &Prompt, config: &LlmConfig) -> Result<String> {
        let body = serde_json::json!({
            "model": config.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user}
            ],
            "temperature": config.temperature,
            "max_tokens": config.max_tokens
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose())
            .timeout(config.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NlSqlError::generation(
                        GenerationErrorKind::Timeout,
                        format!("no response within {:?}", config.request_timeout),
                    )
                } else {
                    NlSqlError::Transport(format!("chat completion request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(NlSqlError::generation(
                GenerationErrorKind::Auth,
                format!("completion endpoint refused credentials (HTTP {})", status),
            ));
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(NlSqlError::Transport(format!(
                "completion endpoint returned HTTP {}",
                status
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(NlSqlError::generation(
                GenerationErrorKind::Rejected,
                format!("HTTP {}: {}", status, text.chars().take(300).collect::<String>()),
            ));
        }

        let response_json: serde_json::Value = response.json().await.map_err(|e| {
            NlSqlError::generation(
                GenerationErrorKind::MalformedResponse,
                format!("response is not JSON: {}", e),
            )
        })?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                NlSqlError::generation(
                    GenerationErrorKind::MalformedResponse,
                    "no message content in completion",
                )
            })?;
        Ok(content.to_string())
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn generate(&self, prompt: &Prompt, config: &LlmConfig) -> Result<CandidateSql> {
        debug!(
            "Requesting completion from {} (~{} prompt tokens)",
            config.model, prompt.estimated_tokens
        );
        let content = retry_with_backoff(&config.retry, "chat completion", || {
            self.complete_once(prompt, config)
        })
        .await
        .map_err(|e| match e {
            NlSqlError::Transport(message) => NlSqlError::generation(
                GenerationErrorKind::RetriesExhausted,
                format!("{} attempt(s): {}", config.retry.max_attempts, message),
            ),
            other => other,
        })?;

        let sql = extract_sql(&content);
        if sql.is_empty() {
            return Err(NlSqlError::generation(
                GenerationErrorKind::MalformedResponse,
                "completion contained no SQL",
            ));
        }
        Ok(CandidateSql::new(sql, &config.model, prompt))
    }
}
