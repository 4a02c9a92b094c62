//! Execution Result - rows returned by a validated query

use crate::execution::engine::Row;
use serde::{Deserialize, Serialize};

/// Result of running one validated query. `row_count` never exceeds the configured row cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Column names in result order
    pub columns: Vec<String>,

    /// Rows in the order the warehouse returned them
    pub rows: Vec<Row>,

    /// Number of rows returned
    pub row_count: usize,

    /// Set when a limit cut the result short
    pub truncated: bool,

    /// Wall-clock execution time in milliseconds
    pub elapsed_ms: u64,

    /// Bytes the warehouse reported as processed
    pub bytes_processed: Option<u64>,

    /// Warehouse job that produced the rows
    pub job_id: String,
}

impl ExecutionResult {
    pub fn new(
        job_id: String,
        columns: Vec<String>,
        rows: Vec<Row>,
        truncated: bool,
        elapsed_ms: u64,
        bytes_processed: Option<u64>,
    ) -> Self {
        Self {
            row_count: rows.len(),
            columns,
            rows,
            truncated,
            elapsed_ms,
            bytes_processed,
            job_id,
        }
    }

    /// Compare row sets. With `ordered` the sequences must match exactly, otherwise they are
    /// compared as multisets (queries without ORDER BY have no defined order).
    pub fn equivalent(&self, other: &ExecutionResult, ordered: bool) -> bool {
        if self.row_count != other.row_count || self.truncated != other.truncated {
            return false;
        }
        if ordered {
            return self.rows == other.rows;
        }
        let mut left: Vec<String> = self.rows.iter().map(row_key).collect();
        let mut right: Vec<String> = other.rows.iter().map(row_key).collect();
        left.sort();
        right.sort();
        left == right
    }
}

// serde_json::Map without preserve_order is a BTreeMap, so this rendering is canonical.
fn row_key(row: &Row) -> String {
    serde_json::Value::Object(row.clone()).to_string()
}
