//! Warehouse Trait - narrow contract between the executor and the remote warehouse
//!
//! The executor never talks HTTP itself: it submits jobs, pages through results and cancels
//! through this trait, so the transport can be swapped (BigQuery REST in production, in-process
//! fakes in tests).

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One result row: column name -> value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Options attached to a job submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Server-side cap on bytes billed; the warehouse fails the job past it
    pub max_bytes_billed: u64,
    /// Rows requested per page
    pub page_size: usize,
}

/// One page of results from a running or finished job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultPage {
    /// False while the job is still running; rows are empty in that case
    pub complete: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub next_page_token: Option<String>,
    pub bytes_processed: Option<u64>,
}

/// Warehouse transport. Network failures that may succeed on a fresh attempt must be reported
/// as `NlSqlError::Transport`; anything else is terminal.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Warehouse name (e.g., "bigquery")
    fn name(&self) -> &str;

    /// Whether a table exists in the configured dataset
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Bytes the query would scan, without running it
    async fn dry_run_bytes(&self, sql: &str) -> Result<u64>;

    /// Submit a query under a caller-chosen job id
    async fn start_job(&self, job_id: &str, sql: &str, options: &JobOptions) -> Result<()>;

    /// Fetch the next page of results
    async fn fetch_page(
        &self,
        job_id: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<ResultPage>;

    /// Best-effort cancellation of a running job
    async fn cancel_job(&self, job_id: &str) -> Result<()>;
}
