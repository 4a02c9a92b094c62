use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a language-model generation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorKind {
    /// Prompt still exceeds the token budget after schema elision
    PromptTooLarge,
    /// Credentials were refused by the completion endpoint
    Auth,
    /// Endpoint answered but the payload was unusable
    MalformedResponse,
    /// Endpoint refused the request for a non-transient reason
    Rejected,
    /// Overall generation deadline passed
    Timeout,
    /// Transient failures persisted past the attempt ceiling
    RetriesExhausted,
}

impl fmt::Display for GenerationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationErrorKind::PromptTooLarge => write!(f, "prompt too large"),
            GenerationErrorKind::Auth => write!(f, "authentication failed"),
            GenerationErrorKind::MalformedResponse => write!(f, "malformed response"),
            GenerationErrorKind::Rejected => write!(f, "request rejected"),
            GenerationErrorKind::Timeout => write!(f, "timed out"),
            GenerationErrorKind::RetriesExhausted => write!(f, "retries exhausted"),
        }
    }
}

/// Execution limit that was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLimit {
    Rows,
    BytesScanned,
    Duration,
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceLimit::Rows => write!(f, "max rows"),
            ResourceLimit::BytesScanned => write!(f, "max bytes scanned"),
            ResourceLimit::Duration => write!(f, "max duration"),
        }
    }
}

#[derive(Error, Debug)]
pub enum NlSqlError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Generation error ({kind}): {message}")]
    Generation {
        kind: GenerationErrorKind,
        message: String,
    },

    #[error("Unsafe query: {0}")]
    UnsafeQuery(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Resource limit exceeded ({limit}): {message}")]
    ResourceLimitExceeded {
        limit: ResourceLimit,
        message: String,
    },

    #[error("Execution error: {0}")]
    Execution(String),

    // Retryable warehouse network failure; the executor folds it into Execution.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl NlSqlError {
    pub fn generation(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        NlSqlError::Generation {
            kind,
            message: message.into(),
        }
    }

    pub fn limit(limit: ResourceLimit, message: impl Into<String>) -> Self {
        NlSqlError::ResourceLimitExceeded {
            limit,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            NlSqlError::Configuration(_) | NlSqlError::Yaml(_) => ErrorKind::Configuration,
            NlSqlError::Generation { .. } => ErrorKind::Generation,
            NlSqlError::UnsafeQuery(_) => ErrorKind::UnsafeQuery,
            NlSqlError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            NlSqlError::ResourceLimitExceeded { .. } => ErrorKind::ResourceLimitExceeded,
            NlSqlError::Execution(_)
            | NlSqlError::Transport(_)
            | NlSqlError::Io(_)
            | NlSqlError::Json(_) => ErrorKind::Execution,
        }
    }

    /// Transport failures and request timeouts qualify for a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NlSqlError::Transport(_)
                | NlSqlError::Generation {
                    kind: GenerationErrorKind::Timeout,
                    ..
                }
        )
    }

    /// Configuration errors abort the run; everything else is per-request.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Coarse error taxonomy reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Generation,
    UnsafeQuery,
    SchemaMismatch,
    ResourceLimitExceeded,
    Execution,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "ConfigurationError"),
            ErrorKind::Generation => write!(f, "GenerationError"),
            ErrorKind::UnsafeQuery => write!(f, "UnsafeQueryError"),
            ErrorKind::SchemaMismatch => write!(f, "SchemaMismatchError"),
            ErrorKind::ResourceLimitExceeded => write!(f, "ResourceLimitExceeded"),
            ErrorKind::Execution => write!(f, "ExecutionError"),
        }
    }
}

/// Structured error shape handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, NlSqlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        assert_eq!(
            NlSqlError::Configuration("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            NlSqlError::Transport("reset".into()).kind(),
            ErrorKind::Execution
        );
        assert_eq!(
            NlSqlError::limit(ResourceLimit::Rows, "too many").kind(),
            ErrorKind::ResourceLimitExceeded
        );
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(NlSqlError::Transport("timeout".into()).is_retryable());
        assert!(NlSqlError::generation(GenerationErrorKind::Timeout, "30s").is_retryable());
        assert!(!NlSqlError::generation(GenerationErrorKind::Auth, "401").is_retryable());
        assert!(!NlSqlError::UnsafeQuery("drop".into()).is_retryable());
        assert!(!NlSqlError::Execution("bad".into()).is_retryable());
    }

    #[test]
    fn test_report_carries_subkind_in_message() {
        let report =
            NlSqlError::generation(GenerationErrorKind::PromptTooLarge, "4100 > 4000").report();
        assert_eq!(report.kind, ErrorKind::Generation);
        assert!(report.message.contains("prompt too large"));
        assert!(NlSqlError::Configuration("x".into()).is_fatal());
    }
}
