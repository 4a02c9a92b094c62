//! Query Executor
//!
//! Runs validated queries against a `Warehouse` under row, byte and wall-clock limits. A limit
//! breach cancels the remote job and fails the request, unless truncate-on-limit is configured,
//! in which case the rows gathered before the first crossed limit are returned with the
//! truncation flag set.

use crate::error::{NlSqlError, ResourceLimit, Result};
use crate::execution::engine::{JobOptions, Row, Warehouse};
use crate::execution::result::ExecutionResult;
use crate::validation::ValidatedQuery;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_PAGE_SIZE: usize = 10_000;

/// What to do when a limit is crossed mid-execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitPolicy {
    Fail,
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_rows: usize,
    pub max_bytes_scanned: u64,
    pub max_duration: Duration,
    pub policy: LimitPolicy,
    pub poll_interval: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_rows: 1_000,
            max_bytes_scanned: 1024 * 1024 * 1024,
            max_duration: Duration::from_secs(60),
            policy: LimitPolicy::Fail,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl ExecutionLimits {
    fn page_size(&self) -> usize {
        // One extra row tells a full result apart from an overflowing one.
        self.max_rows.saturating_add(1).min(MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Default)]
struct Collected {
    columns: Vec<String>,
    rows: Vec<Row>,
    bytes_processed: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
enum CollectStatus {
    Done,
    LimitHit(ResourceLimit),
}

pub struct QueryExecutor {
    warehouse: Arc<dyn Warehouse>,
}

impl QueryExecutor {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Execute a validated query. Transport failures are retried once under a fresh job id;
    /// validated queries are pure reads, so the retry cannot duplicate side effects.
    pub async fn execute(
        &self,
        query: &ValidatedQuery,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult> {
        match self.run_job(query, limits).await {
            Err(e) if e.is_retryable() && query.is_idempotent() => {
                warn!("Warehouse transport failure, retrying with a fresh job: {}", e);
                self.run_job(query, limits).await.map_err(|retry_err| match retry_err {
                    NlSqlError::Transport(cause) => NlSqlError::Execution(format!(
                        "{} failed after retry: {}",
                        self.warehouse.name(),
                        cause
                    )),
                    other => other,
                })
            }
            Err(NlSqlError::Transport(cause)) => Err(NlSqlError::Execution(cause)),
            other => other,
        }
    }

    async fn run_job(
        &self,
        query: &ValidatedQuery,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult> {
        let sql = query.sql();
        let started = Instant::now();

        let estimated = self.warehouse.dry_run_bytes(sql).await?;
        if estimated > limits.max_bytes_scanned {
            return Err(NlSqlError::limit(
                ResourceLimit::BytesScanned,
                format!(
                    "query would scan {} bytes (max {})",
                    estimated, limits.max_bytes_scanned
                ),
            ));
        }

        let job_id = format!("nlsql_{}", Uuid::new_v4().simple());
        let options = JobOptions {
            max_bytes_billed: limits.max_bytes_scanned,
            page_size: limits.page_size(),
        };
        info!("Starting job {} ({} bytes estimated)", job_id, estimated);
        self.warehouse.start_job(&job_id, sql, &options).await?;

        let mut collected = Collected::default();
        let outcome = tokio::time::timeout(
            limits.max_duration,
            self.collect(&job_id, limits, &mut collected),
        )
        .await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.cancel(&job_id).await;
                return Err(e);
            }
            Err(_) => CollectStatus::LimitHit(ResourceLimit::Duration),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match status {
            CollectStatus::Done => {
                debug!("Job {} finished with {} rows", job_id, collected.rows.len());
                Ok(ExecutionResult::new(
                    job_id,
                    collected.columns,
                    collected.rows,
                    false,
                    elapsed_ms,
                    collected.bytes_processed,
                ))
            }
            CollectStatus::LimitHit(limit) => {
                self.cancel(&job_id).await;
                match limits.policy {
                    LimitPolicy::Truncate => {
                        info!(
                            "Job {} truncated at {} rows ({} crossed)",
                            job_id,
                            collected.rows.len(),
                            limit
                        );
                        Ok(ExecutionResult::new(
                            job_id,
                            collected.columns,
                            collected.rows,
                            true,
                            elapsed_ms,
                            collected.bytes_processed,
                        ))
                    }
                    LimitPolicy::Fail => Err(NlSqlError::limit(
                        limit,
                        format!("job {} cancelled after {} ms", job_id, elapsed_ms),
                    )),
                }
            }
        }
    }

    async fn collect(
        &self,
        job_id: &str,
        limits: &ExecutionLimits,
        acc: &mut Collected,
    ) -> Result<CollectStatus> {
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .warehouse
                .fetch_page(job_id, page_token.as_deref(), limits.page_size())
                .await?;

            if !page.complete {
                tokio::time::sleep(limits.poll_interval).await;
                continue;
            }

            if acc.columns.is_empty() {
                acc.columns = page.columns;
            }
            if let Some(bytes) = page.bytes_processed {
                acc.bytes_processed = Some(bytes);
                if bytes > limits.max_bytes_scanned {
                    return Ok(CollectStatus::LimitHit(ResourceLimit::BytesScanned));
                }
            }
            for row in page.rows {
                if acc.rows.len() >= limits.max_rows {
                    return Ok(CollectStatus::LimitHit(ResourceLimit::Rows));
                }
                acc.rows.push(row);
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(CollectStatus::Done),
            }
        }
    }

    async fn cancel(&self, job_id: &str) {
        if let Err(e) = self.warehouse.cancel_job(job_id).await {
            warn!("Failed to cancel job {}: {}", job_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::engine::ResultPage;
    use crate::metadata::corpus_stats_fixture;
    use crate::validation::SqlValidator;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves fixed pages; optionally fails the first N starts with a transport error.
    struct ScriptedWarehouse {
        pages: Vec<ResultPage>,
        dry_run_bytes: u64,
        transport_failures: AtomicUsize,
        hang: bool,
        /// Serve rows in reverse order on every job after the first.
        reorder_reruns: bool,
        starts: AtomicUsize,
        cancels: Mutex<Vec<String>>,
    }

    impl ScriptedWarehouse {
        fn new(pages: Vec<ResultPage>) -> Self {
            Self {
                pages,
                dry_run_bytes: 100,
                transport_failures: AtomicUsize::new(0),
                hang: false,
                reorder_reruns: false,
                starts: AtomicUsize::new(0),
                cancels: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Warehouse for ScriptedWarehouse {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn table_exists(&self, _table: &str) -> Result<bool> {
            Ok(true)
        }

        async fn dry_run_bytes(&self, _sql: &str) -> Result<u64> {
            Ok(self.dry_run_bytes)
        }

        async fn start_job(&self, _job_id: &str, _sql: &str, _options: &JobOptions) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.transport_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transport_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(NlSqlError::Transport("connection reset".to_string()));
            }
            Ok(())
        }

        async fn fetch_page(
            &self,
            _job_id: &str,
            page_token: Option<&str>,
            _page_size: usize,
        ) -> Result<ResultPage> {
            if self.hang {
                return Ok(ResultPage::default());
            }
            let index = page_token.map(|t| t.parse::<usize>().unwrap()).unwrap_or(0);
            let mut page = self.pages[index].clone();
            if self.reorder_reruns && self.starts.load(Ordering::SeqCst) > 1 {
                page.rows.reverse();
            }
            Ok(page)
        }

        async fn cancel_job(&self, job_id: &str) -> Result<()> {
            self.cancels.lock().unwrap().push(job_id.to_string());
            Ok(())
        }
    }

    fn rows(range: std::ops::Range<i64>) -> Vec<Row> {
        range
            .map(|i| {
                let mut row = Row::new();
                row.insert("word_count".to_string(), json!(i));
                row
            })
            .collect()
    }

    fn page(rows: Vec<Row>, next: Option<&str>) -> ResultPage {
        ResultPage {
            complete: true,
            columns: vec!["word_count".to_string()],
            rows,
            next_page_token: next.map(str::to_string),
            bytes_processed: Some(100),
        }
    }

    fn query() -> ValidatedQuery {
        SqlValidator::new()
            .validate("SELECT word_count FROM corpus_stats", &corpus_stats_fixture())
            .unwrap()
    }

    fn limits(max_rows: usize, policy: LimitPolicy) -> ExecutionLimits {
        ExecutionLimits {
            max_rows,
            policy,
            poll_interval: Duration::from_millis(1),
            ..ExecutionLimits::default()
        }
    }

    #[tokio::test]
    async fn test_collects_all_pages() {
        let warehouse = Arc::new(ScriptedWarehouse::new(vec![
            page(rows(0..2), Some("1")),
            page(rows(2..3), None),
        ]));
        let executor = QueryExecutor::new(warehouse.clone());
        let result = executor
            .execute(&query(), &limits(10, LimitPolicy::Fail))
            .await
            .unwrap();
        assert_eq!(result.row_count, 3);
        assert!(!result.truncated);
        assert!(warehouse.cancels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_row_cap_fails_and_cancels() {
        let warehouse = Arc::new(ScriptedWarehouse::new(vec![page(rows(0..5), None)]));
        let executor = QueryExecutor::new(warehouse.clone());
        let err = executor
            .execute(&query(), &limits(3, LimitPolicy::Fail))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NlSqlError::ResourceLimitExceeded {
                limit: ResourceLimit::Rows,
                ..
            }
        ));
        assert_eq!(warehouse.cancels.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_row_cap_truncates_when_configured() {
        let warehouse = Arc::new(ScriptedWarehouse::new(vec![page(rows(0..5), None)]));
        let executor = QueryExecutor::new(warehouse);
        let result = executor
            .execute(&query(), &limits(3, LimitPolicy::Truncate))
            .await
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.row_count, 3);
    }

    #[tokio::test]
    async fn test_exact_cap_is_not_truncated() {
        let warehouse = Arc::new(ScriptedWarehouse::new(vec![page(rows(0..3), None)]));
        let executor = QueryExecutor::new(warehouse);
        let result = executor
            .execute(&query(), &limits(3, LimitPolicy::Fail))
            .await
            .unwrap();
        assert!(!result.truncated);
        assert_eq!(result.row_count, 3);
    }

    #[tokio::test]
    async fn test_dry_run_over_byte_cap_never_starts_job() {
        let mut warehouse = ScriptedWarehouse::new(vec![page(rows(0..1), None)]);
        warehouse.dry_run_bytes = u64::MAX;
        let warehouse = Arc::new(warehouse);
        let executor = QueryExecutor::new(warehouse.clone());
        let err = executor
            .execute(&query(), &limits(3, LimitPolicy::Truncate))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NlSqlError::ResourceLimitExceeded {
                limit: ResourceLimit::BytesScanned,
                ..
            }
        ));
        assert_eq!(warehouse.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_cancels_job() {
        let mut warehouse = ScriptedWarehouse::new(vec![]);
        warehouse.hang = true;
        let warehouse = Arc::new(warehouse);
        let executor = QueryExecutor::new(warehouse.clone());
        let mut limits = limits(3, LimitPolicy::Fail);
        limits.max_duration = Duration::from_millis(20);
        let err = executor.execute(&query(), &limits).await.unwrap_err();
        assert!(matches!(
            err,
            NlSqlError::ResourceLimitExceeded {
                limit: ResourceLimit::Duration,
                ..
            }
        ));
        assert_eq!(warehouse.cancels.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_retried_once() {
        let warehouse = ScriptedWarehouse::new(vec![page(rows(0..1), None)]);
        warehouse.transport_failures.store(1, Ordering::SeqCst);
        let warehouse = Arc::new(warehouse);
        let executor = QueryExecutor::new(warehouse.clone());
        let result = executor
            .execute(&query(), &limits(3, LimitPolicy::Fail))
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert_eq!(warehouse.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_transport_failure_is_execution_error() {
        let warehouse = ScriptedWarehouse::new(vec![page(rows(0..1), None)]);
        warehouse.transport_failures.store(5, Ordering::SeqCst);
        let warehouse = Arc::new(warehouse);
        let executor = QueryExecutor::new(warehouse.clone());
        let err = executor
            .execute(&query(), &limits(3, LimitPolicy::Fail))
            .await
            .unwrap_err();
        assert!(matches!(err, NlSqlError::Execution(_)));
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(warehouse.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_page_size_saturates_for_unbounded_rows() {
        let unbounded = ExecutionLimits {
            max_rows: usize::MAX,
            ..ExecutionLimits::default()
        };
        assert_eq!(unbounded.page_size(), MAX_PAGE_SIZE);
        assert_eq!(limits(3, LimitPolicy::Fail).page_size(), 4);
    }

    #[tokio::test]
    async fn test_rerun_of_unordered_query_is_equivalent() {
        let mut warehouse = ScriptedWarehouse::new(vec![page(rows(0..4), None)]);
        warehouse.reorder_reruns = true;
        let warehouse = Arc::new(warehouse);
        let executor = QueryExecutor::new(warehouse.clone());
        let query = query();
        let limits = limits(10, LimitPolicy::Fail);

        let first = executor.execute(&query, &limits).await.unwrap();
        let second = executor.execute(&query, &limits).await.unwrap();
        assert_ne!(first.job_id, second.job_id);
        assert_ne!(first.rows, second.rows);
        assert!(!query.has_order_by());
        assert!(first.equivalent(&second, query.has_order_by()));
        // Row order only matters when the query asks for one.
        assert!(!first.equivalent(&second, true));
    }

    #[tokio::test]
    async fn test_rerun_of_ordered_query_is_equivalent() {
        let warehouse = Arc::new(ScriptedWarehouse::new(vec![
            page(rows(0..2), Some("1")),
            page(rows(2..4), None),
        ]));
        let executor = QueryExecutor::new(warehouse.clone());
        let query = SqlValidator::new()
            .validate(
                "SELECT word_count FROM corpus_stats ORDER BY word_count",
                &corpus_stats_fixture(),
            )
            .unwrap();
        let limits = limits(10, LimitPolicy::Fail);

        let first = executor.execute(&query, &limits).await.unwrap();
        let second = executor.execute(&query, &limits).await.unwrap();
        assert!(query.has_order_by());
        assert!(first.equivalent(&second, query.has_order_by()));
        assert_eq!(warehouse.starts.load(Ordering::SeqCst), 2);
    }
}
