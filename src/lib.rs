pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod llm;
pub mod metadata;
pub mod pipeline;
pub mod prompt;
pub mod validation;

pub use cache::{CacheKey, QueryCache};
pub use config::AppConfig;
pub use error::{ErrorKind, ErrorReport, NlSqlError, Result};
pub use execution::{BigQueryWarehouse, ExecutionLimits, ExecutionResult, QueryExecutor, Warehouse};
pub use llm::{CandidateSql, LanguageModel, LlmConfig, OpenAiClient};
pub use metadata::SchemaCatalog;
pub use pipeline::{NlToSqlPipeline, PipelineOptions, PipelineState, QueryResponse, TranslationRequest};
pub use prompt::{ConversationTurn, Prompt, PromptBuilder};
pub use validation::{SqlValidator, ValidatedQuery};
