//! YAML configuration
//!
//! Mirrors the layout of `config.yaml`: `bigquery`, `openai`, `table_metadata` and an optional
//! `pipeline` section. Secrets may be omitted from the file and supplied through the
//! environment instead.

use crate::error::{NlSqlError, Result};
use crate::execution::{ExecutionLimits, LimitPolicy};
use crate::llm::{LlmConfig, RetryPolicy};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const BIGQUERY_ACCESS_TOKEN_ENV: &str = "BIGQUERY_ACCESS_TOKEN";

/// String that never shows up in logs or debug output.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bigquery: BigQueryConfig,
    pub openai: OpenAiConfig,
    pub table_metadata: TableMetadata,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset_id: String,
    pub table_name: String,
    #[serde(default)]
    pub credentials_path: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_bigquery_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub access_token: Option<Secret>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: Secret,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_max_bytes_scanned")]
    pub max_bytes_scanned: u64,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default)]
    pub truncate_on_limit: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Schema description, either a list of tables or a single table named by
/// `bigquery.table_name`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TableMetadata {
    Catalog { tables: Vec<TableSpec> },
    Single(TableSpec),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<ColumnSpec>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub data_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_bigquery_api_base_url() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}
fn default_model() -> String {
    "gpt-4".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    500
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    8_000
}
fn default_cache_ttl_secs() -> u64 {
    900
}
fn default_max_prompt_tokens() -> usize {
    3_000
}
fn default_max_history_turns() -> usize {
    3
}
fn default_max_rows() -> usize {
    1_000
}
fn default_max_bytes_scanned() -> u64 {
    1024 * 1024 * 1024
}
fn default_max_duration_secs() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            max_prompt_tokens: default_max_prompt_tokens(),
            max_history_turns: default_max_history_turns(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes_scanned: default_max_bytes_scanned(),
            max_duration_secs: default_max_duration_secs(),
            truncate_on_limit: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl AppConfig {
    /// Load and validate a YAML config file, filling secrets from the process environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            NlSqlError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Self::from_yaml_str_with_env(raw, |key| std::env::var(key).ok())
    }

    /// Parse with an explicit environment lookup.
    pub fn from_yaml_str_with_env<F>(raw: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: AppConfig = serde_yaml::from_str(raw)
            .map_err(|e| NlSqlError::Configuration(format!("invalid config: {}", e)))?;

        if config.openai.api_key.is_empty() {
            if let Some(key) = env(OPENAI_API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
                config.openai.api_key = Secret::new(key);
            }
        }
        if config.bigquery.access_token.is_none() {
            config.bigquery.access_token = env(BIGQUERY_ACCESS_TOKEN_ENV)
                .filter(|t| !t.trim().is_empty())
                .map(Secret::new);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("bigquery.project_id", &self.bigquery.project_id),
            ("bigquery.dataset_id", &self.bigquery.dataset_id),
            ("bigquery.table_name", &self.bigquery.table_name),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(NlSqlError::Configuration(format!("{} is required", key)));
            }
        }
        if self.openai.api_key.is_empty() {
            return Err(NlSqlError::Configuration(format!(
                "openai.api_key is required (or set {})",
                OPENAI_API_KEY_ENV
            )));
        }
        self.llm_config().validate()?;

        let limits = &self.pipeline.limits;
        if limits.max_rows == 0 || limits.max_bytes_scanned == 0 || limits.max_duration_secs == 0 {
            return Err(NlSqlError::Configuration(
                "pipeline.limits values must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.max_prompt_tokens == 0 {
            return Err(NlSqlError::Configuration(
                "pipeline.max_prompt_tokens must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            model: self.openai.model.clone(),
            temperature: self.openai.temperature,
            max_tokens: self.openai.max_tokens,
            request_timeout: Duration::from_secs(self.openai.request_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.openai.max_attempts,
                initial_backoff: Duration::from_millis(self.openai.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.openai.max_backoff_ms),
            },
        }
    }

    pub fn execution_limits(&self) -> ExecutionLimits {
        let limits = &self.pipeline.limits;
        ExecutionLimits {
            max_rows: limits.max_rows,
            max_bytes_scanned: limits.max_bytes_scanned,
            max_duration: Duration::from_secs(limits.max_duration_secs),
            policy: if limits.truncate_on_limit {
                LimitPolicy::Truncate
            } else {
                LimitPolicy::Fail
            },
            poll_interval: Duration::from_millis(limits.poll_interval_ms),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pipeline.cache_ttl_secs)
    }
}
