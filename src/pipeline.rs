//! Pipeline Orchestrator
//!
//! Drives one question through prompt, generation, validation and execution:
//!
//! ```text
//! Received -> Prompted -> Generated -> Validated -> Executed -> Completed
//!     \__________\___________\____________\___________\______> Failed(kind)
//! ```
//!
//! A fresh cache hit goes straight from `Received` to `Completed`. Misses take a per-key lock
//! before prompting so concurrent duplicates reuse the first caller's result.

use crate::cache::{CacheEntry, CacheKey, QueryCache};
use crate::config::AppConfig;
use crate::error::{ErrorKind, NlSqlError, Result};
use crate::execution::{ExecutionLimits, ExecutionResult, QueryExecutor, Row, Warehouse};
use crate::llm::{extract_sql, LanguageModel, LlmConfig};
use crate::metadata::SchemaCatalog;
use crate::prompt::{ConversationTurn, PromptBuilder};
use crate::validation::{SqlValidator, ValidatedQuery};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Prompted,
    Generated,
    Validated,
    Executed,
    Completed,
    Failed(ErrorKind),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed(_))
    }
}

/// Ordered record of the states one request passed through.
#[derive(Debug)]
struct StateTrace {
    request_id: String,
    states: Vec<PipelineState>,
}

impl StateTrace {
    fn new(request_id: String) -> Self {
        debug!("[{}] -> Received", request_id);
        Self {
            request_id,
            states: vec![PipelineState::Received],
        }
    }

    fn current(&self) -> PipelineState {
        self.states
            .last()
            .copied()
            .unwrap_or(PipelineState::Received)
    }

    fn advance(&mut self, next: PipelineState) {
        let current = self.current();
        if current.is_terminal() {
            warn!(
                "[{}] ignoring transition {:?} -> {:?}",
                self.request_id, current, next
            );
            return;
        }
        debug!("[{}] {:?} -> {:?}", self.request_id, current, next);
        self.states.push(next);
    }

    fn fail(&mut self, error: &NlSqlError) {
        warn!(
            "[{}] failed in {:?}: {}",
            self.request_id,
            self.current(),
            error
        );
        self.advance(PipelineState::Failed(error.kind()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub question: String,

    /// Earlier turns of the same conversation, oldest first
    #[serde(default)]
    pub context: Vec<ConversationTurn>,

    /// Schema version the caller expects, if it pinned one
    #[serde(default)]
    pub schema_version: Option<String>,
}

impl TranslationRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            context: Vec::new(),
            schema_version: None,
        }
    }

    pub fn with_context(mut self, context: Vec<ConversationTurn>) -> Self {
        self.context = context;
        self
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub request_id: String,
    pub sql_query: String,
    pub columns: Vec<String>,
    pub results: Vec<Row>,
    pub row_count: usize,
    pub truncated: bool,
    /// Row order is meaningful (top-level ORDER BY)
    pub ordered: bool,
    pub elapsed_ms: u64,
    pub cached: bool,
    pub states: Vec<PipelineState>,
}

impl QueryResponse {
    fn build(
        trace: StateTrace,
        query: &ValidatedQuery,
        result: ExecutionResult,
        cached: bool,
    ) -> Self {
        Self {
            request_id: trace.request_id,
            sql_query: query.sql().to_string(),
            columns: result.columns,
            results: result.rows,
            row_count: result.row_count,
            truncated: result.truncated,
            ordered: query.has_order_by(),
            elapsed_ms: result.elapsed_ms,
            cached,
            states: trace.states,
        }
    }
}

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub llm: LlmConfig,
    pub limits: ExecutionLimits,
    pub cache_ttl: Duration,
    pub max_prompt_tokens: usize,
    pub max_history_turns: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            limits: ExecutionLimits::default(),
            cache_ttl: Duration::from_secs(900),
            max_prompt_tokens: 3000,
            max_history_turns: 3,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            llm: config.llm_config(),
            limits: config.execution_limits(),
            cache_ttl: config.cache_ttl(),
            max_prompt_tokens: config.pipeline.max_prompt_tokens,
            max_history_turns: config.pipeline.max_history_turns,
        }
    }
}

pub struct NlToSqlPipeline {
    catalog: RwLock<Arc<SchemaCatalog>>,
    prompt_builder: PromptBuilder,
    llm: Arc<dyn LanguageModel>,
    llm_config: LlmConfig,
    validator: SqlValidator,
    executor: QueryExecutor,
    limits: ExecutionLimits,
    cache: QueryCache,
}

impl NlToSqlPipeline {
    pub fn new(
        catalog: SchemaCatalog,
        llm: Arc<dyn LanguageModel>,
        warehouse: Arc<dyn Warehouse>,
        options: PipelineOptions,
    ) -> Result<Self> {
        options.llm.validate()?;
        if options.max_prompt_tokens == 0 {
            return Err(NlSqlError::Configuration(
                "prompt token budget must be greater than zero".to_string(),
            ));
        }
        info!(
            "Pipeline ready: catalog {} on {}, model {}",
            catalog.version(),
            warehouse.name(),
            options.llm.model
        );
        Ok(Self {
            catalog: RwLock::new(Arc::new(catalog)),
            prompt_builder: PromptBuilder::new(options.max_prompt_tokens, options.max_history_turns),
            llm,
            llm_config: options.llm,
            validator: SqlValidator::new(),
            executor: QueryExecutor::new(warehouse),
            limits: options.limits,
            cache: QueryCache::new(options.cache_ttl),
        })
    }

    /// Current catalog snapshot.
    pub async fn catalog(&self) -> Arc<SchemaCatalog> {
        self.catalog.read().await.clone()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Answer a single question with no conversation context.
    pub async fn process_natural_language_query(&self, question: &str) -> Result<QueryResponse> {
        self.process(TranslationRequest::new(question)).await
    }

    pub async fn process(&self, request: TranslationRequest) -> Result<QueryResponse> {
        let mut trace = StateTrace::new(Uuid::new_v4().to_string());
        let catalog = self.catalog().await;

        if let Some(expected) = &request.schema_version {
            if expected != catalog.version() {
                let error = NlSqlError::SchemaMismatch(format!(
                    "request targets schema version {}, catalog is at {}",
                    expected,
                    catalog.version()
                ));
                trace.fail(&error);
                return Err(error);
            }
        }

        let key = CacheKey::new(
            &request.question,
            self.prompt_builder.recent_turns(&request.context),
            catalog.version(),
        );
        if let Some(entry) = self.cache.get(&key, catalog.version()) {
            return Ok(Self::from_cache(trace, entry));
        }

        let _guard = self.cache.lock(&key).await;
        // A duplicate may have populated the entry while this caller waited.
        if let Some(entry) = self.cache.get(&key, catalog.version()) {
            return Ok(Self::from_cache(trace, entry));
        }

        match self.run(&request, &catalog, &mut trace).await {
            Ok((query, result)) => {
                let current = self.catalog().await;
                if current.version() == catalog.version() {
                    self.cache
                        .insert(key, query.clone(), result.clone(), catalog.version());
                } else {
                    debug!(
                        "[{}] catalog moved to {} while running, result not cached",
                        trace.request_id,
                        current.version()
                    );
                }
                trace.advance(PipelineState::Completed);
                info!(
                    "[{}] completed: {} row(s){} in {} ms",
                    trace.request_id,
                    result.row_count,
                    if result.truncated { " (truncated)" } else { "" },
                    result.elapsed_ms
                );
                Ok(QueryResponse::build(trace, &query, result, false))
            }
            Err(e) => {
                trace.fail(&e);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &TranslationRequest,
        catalog: &SchemaCatalog,
        trace: &mut StateTrace,
    ) -> Result<(ValidatedQuery, ExecutionResult)> {
        let prompt = self
            .prompt_builder
            .build(&request.question, catalog, &request.context)?;
        trace.advance(PipelineState::Prompted);

        let candidate = self.llm.generate(&prompt, &self.llm_config).await?;
        debug!(
            "[{}] candidate from {} (prompt {})",
            trace.request_id, candidate.provenance.model, candidate.provenance.prompt_hash
        );
        trace.advance(PipelineState::Generated);

        let sql = extract_sql(&candidate.sql);
        let query = self.validator.validate(&sql, catalog)?;
        trace.advance(PipelineState::Validated);

        let result = self.executor.execute(&query, &self.limits).await?;
        trace.advance(PipelineState::Executed);

        Ok((query, result))
    }

    fn from_cache(mut trace: StateTrace, entry: CacheEntry) -> QueryResponse {
        info!("[{}] cache hit", trace.request_id);
        trace.advance(PipelineState::Completed);
        QueryResponse::build(trace, &entry.query, entry.result, true)
    }

    /// Swap in a new catalog. Entries built against other versions are dropped; returns false
    /// when the version did not change.
    pub async fn reload_catalog(&self, catalog: SchemaCatalog) -> bool {
        let mut current = self.catalog.write().await;
        if current.version() == catalog.version() {
            debug!("Catalog reload skipped, version {} unchanged", catalog.version());
            return false;
        }
        info!(
            "Catalog version {} -> {}",
            current.version(),
            catalog.version()
        );
        self.cache.retain_version(catalog.version());
        *current = Arc::new(catalog);
        true
    }

    /// Drop cached results and pending key locks.
    pub fn shutdown(&self) {
        info!("Shutting down pipeline, dropping {} cache entries", self.cache.len());
        self.cache.clear();
    }
}
