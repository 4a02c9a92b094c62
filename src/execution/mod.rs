//! Execution Module - runs validated queries against the warehouse
//!
//! - `Warehouse` trait: the narrow transport contract (submit, page, cancel)
//! - `QueryExecutor`: row/byte/duration limits, cancellation and the single idempotent retry
//! - `BigQueryWarehouse`: BigQuery v2 REST implementation

pub mod engine;
pub mod executor;
pub mod result;

pub mod bigquery_engine;

pub use bigquery_engine::BigQueryWarehouse;
pub use engine::{JobOptions, ResultPage, Row, Warehouse};
pub use executor::{ExecutionLimits, LimitPolicy, QueryExecutor};
pub use result::ExecutionResult;
