//! BigQuery Warehouse
//!
//! Talks to the BigQuery v2 REST API: dry-run queries for byte estimates, jobs.insert with a
//! caller-chosen job id, paged getQueryResults, jobs.cancel and tables.get.

use crate::config::{BigQueryConfig, Secret};
use crate::error::{NlSqlError, ResourceLimit, Result};
use crate::execution::engine::{JobOptions, ResultPage, Row, Warehouse};
use async_trait::async_trait;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

// How long a single getQueryResults call may block server-side waiting for completion.
const RESULTS_WAIT_MS: u64 = 1_000;

const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

/// How requests are authorized.
enum Credentials {
    Bearer(Secret),
    /// Tokens are minted from the key and refreshed before they expire.
    ServiceAccount(CustomServiceAccount),
}

/// BigQuery REST warehouse
pub struct BigQueryWarehouse {
    client: Client,
    api_base_url: String,
    project_id: String,
    dataset_id: String,
    location: Option<String>,
    credentials: Credentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DryRunResponse {
    total_bytes_processed: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultsResponse {
    #[serde(default)]
    job_complete: bool,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
    total_bytes_processed: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableField>,
}

#[derive(Debug, Deserialize)]
struct TableField {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

impl BigQueryWarehouse {
    /// Create a BigQuery warehouse from config.
    ///
    /// The bearer token comes from `bigquery.access_token` (or `BIGQUERY_ACCESS_TOKEN`), else
    /// from the file at `credentials_path`. That file may hold a raw token, a JSON document with
    /// an `access_token`/`token` field, or a service-account key.
    pub fn from_config(config: &BigQueryConfig) -> Result<Self> {
        let credentials = match (&config.access_token, &config.credentials_path) {
            (Some(token), _) if !token.is_empty() => Credentials::Bearer(token.clone()),
            (_, Some(path)) => Self::read_credentials(path)?,
            _ => {
                return Err(NlSqlError::Configuration(
                    "no BigQuery credentials: set bigquery.access_token, BIGQUERY_ACCESS_TOKEN \
                     or bigquery.credentials_path"
                        .to_string(),
                ))
            }
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| {
                NlSqlError::Configuration(format!("failed to create BigQuery HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            dataset_id: config.dataset_id.clone(),
            location: config.location.clone(),
            credentials,
        })
    }

    fn read_credentials(path: &str) -> Result<Credentials> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            NlSqlError::Configuration(format!("cannot read credentials {}: {}", path, e))
        })?;
        let trimmed = raw.trim();
        if !trimmed.starts_with('{') {
            return if trimmed.is_empty() {
                Err(NlSqlError::Configuration(format!(
                    "credentials file {} is empty",
                    path
                )))
            } else {
                Ok(Credentials::Bearer(Secret::new(trimmed)))
            };
        }

        let doc: Value = serde_json::from_str(trimmed).map_err(|e| {
            NlSqlError::Configuration(format!("credentials file {} is not valid JSON: {}", path, e))
        })?;
        if doc.get("type").and_then(Value::as_str) == Some("service_account") {
            let account = CustomServiceAccount::from_json(trimmed).map_err(|e| {
                NlSqlError::Configuration(format!(
                    "invalid service-account key in {}: {}",
                    path, e
                ))
            })?;
            info!("Using service-account credentials from {}", path);
            return Ok(Credentials::ServiceAccount(account));
        }
        doc.get("access_token")
            .or_else(|| doc.get("token"))
            .and_then(Value::as_str)
            .map(|token| Credentials::Bearer(Secret::new(token)))
            .ok_or_else(|| {
                NlSqlError::Configuration(format!(
                    "credentials file {} has neither an access_token nor a service-account key",
                    path
                ))
            })
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        match &self.credentials {
            Credentials::Bearer(token) => Ok(builder.bearer_auth(token.expose())),
            Credentials::ServiceAccount(account) => {
                let token = account.token(&[BIGQUERY_SCOPE]).await.map_err(|e| {
                    NlSqlError::Transport(format!("service-account token request failed: {}", e))
                })?;
                Ok(builder.bearer_auth(token.as_str()))
            }
        }
    }

    fn default_dataset(&self) -> Value {
        json!({"projectId": self.project_id, "datasetId": self.dataset_id})
    }

    fn location_query(&self) -> Vec<(&'static str, String)> {
        self.location
            .iter()
            .map(|l| ("location", l.clone()))
            .collect()
    }

    async fn send_raw(&self, builder: RequestBuilder, action: &str) -> Result<reqwest::Response> {
        self.authorized(builder)
            .await?
            .send()
            .await
            .map_err(|e| Self::network_error(e, action))
    }

    async fn send(&self, builder: RequestBuilder, action: &str) -> Result<reqwest::Response> {
        let response = self.send_raw(builder, action).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::status_error(status, &body, action))
    }

    /// tables.get answers 404 for a missing table; anything else unsuccessful is an error.
    fn existence_from_status(status: StatusCode, body: &str) -> Result<bool> {
        if status.is_success() {
            Ok(true)
        } else if status == StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            Err(Self::status_error(status, body, "tables.get"))
        }
    }

    fn network_error(e: reqwest::Error, action: &str) -> NlSqlError {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            NlSqlError::Transport(format!("BigQuery {} failed: {}", action, e))
        } else {
            NlSqlError::Execution(format!("BigQuery {} failed: {}", action, e))
        }
    }

    fn status_error(status: StatusCode, body: &str, action: &str) -> NlSqlError {
        let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
        let message = parsed
            .as_ref()
            .map(|p| p.error.message.clone())
            .unwrap_or_else(|| body.to_string());
        let over_billing_cap = parsed
            .as_ref()
            .map(|p| p.error.errors.iter().any(|d| d.reason == "bytesBilledLimitExceeded"))
            .unwrap_or(false);

        if over_billing_cap {
            NlSqlError::limit(ResourceLimit::BytesScanned, message)
        } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            NlSqlError::Transport(format!("BigQuery {} returned {}: {}", action, status, message))
        } else {
            NlSqlError::Execution(format!("BigQuery {} returned {}: {}", action, status, message))
        }
    }

    fn parse_bytes(raw: Option<&str>) -> Option<u64> {
        raw.and_then(|b| b.parse::<u64>().ok())
    }

    /// Convert BigQuery's string-encoded cell into a typed JSON value.
    fn convert_cell(field_type: &str, value: Value) -> Value {
        let text = match value {
            Value::String(text) => text,
            other => return other,
        };
        match field_type {
            "INTEGER" | "INT64" => text
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or(Value::String(text)),
            "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => text
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::String(text)),
            "BOOLEAN" | "BOOL" => match text.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(text),
            },
            _ => Value::String(text),
        }
    }

    fn to_page(response: QueryResultsResponse) -> ResultPage {
        if !response.job_complete {
            return ResultPage::default();
        }
        let fields = response.schema.map(|s| s.fields).unwrap_or_default();
        let rows = response
            .rows
            .into_iter()
            .map(|row| {
                fields
                    .iter()
                    .zip(row.f)
                    .map(|(field, cell)| {
                        (field.name.clone(), Self::convert_cell(&field.field_type, cell.v))
                    })
                    .collect::<Row>()
            })
            .collect();

        ResultPage {
            complete: true,
            columns: fields.into_iter().map(|f| f.name).collect(),
            rows,
            next_page_token: response.page_token,
            bytes_processed: Self::parse_bytes(response.total_bytes_processed.as_deref()),
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn name(&self) -> &str {
        "bigquery"
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.api_base_url, self.project_id, self.dataset_id, table
        );
        let response = self.send_raw(self.client.get(&url), "tables.get").await?;
        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        Self::existence_from_status(status, &body)
    }

    async fn dry_run_bytes(&self, sql: &str) -> Result<u64> {
        let url = format!("{}/projects/{}/queries", self.api_base_url, self.project_id);
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "dryRun": true,
            "defaultDataset": self.default_dataset(),
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }

        let response = self
            .send(self.client.post(&url).json(&body), "dry run")
            .await?;
        let parsed: DryRunResponse = response.json().await.map_err(|e| {
            NlSqlError::Execution(format!("Failed to parse BigQuery dry run: {}", e))
        })?;
        let bytes = Self::parse_bytes(parsed.total_bytes_processed.as_deref()).unwrap_or(0);
        debug!("Dry run estimates {} bytes", bytes);
        Ok(bytes)
    }

    async fn start_job(&self, job_id: &str, sql: &str, options: &JobOptions) -> Result<()> {
        let url = format!("{}/projects/{}/jobs", self.api_base_url, self.project_id);
        let mut job_reference = json!({"projectId": self.project_id, "jobId": job_id});
        if let Some(location) = &self.location {
            job_reference["location"] = json!(location);
        }
        let body = json!({
            "jobReference": job_reference,
            "configuration": {
                "query": {
                    "query": sql,
                    "useLegacySql": false,
                    "maximumBytesBilled": options.max_bytes_billed.to_string(),
                    "defaultDataset": self.default_dataset(),
                }
            }
        });

        self.send(self.client.post(&url).json(&body), "jobs.insert")
            .await?;
        info!("BigQuery job submitted: {}", job_id);
        Ok(())
    }

    async fn fetch_page(
        &self,
        job_id: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<ResultPage> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.api_base_url, self.project_id, job_id
        );
        let mut query = self.location_query();
        query.push(("maxResults", page_size.to_string()));
        query.push(("timeoutMs", RESULTS_WAIT_MS.to_string()));
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response = self
            .send(self.client.get(&url).query(&query), "getQueryResults")
            .await?;
        let parsed: QueryResultsResponse = response.json().await.map_err(|e| {
            NlSqlError::Execution(format!("Failed to parse BigQuery results: {}", e))
        })?;
        Ok(Self::to_page(parsed))
    }

    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let url = format!(
            "{}/projects/{}/jobs/{}/cancel",
            self.api_base_url, self.project_id, job_id
        );
        let query = self.location_query();
        match self
            .send(self.client.post(&url).query(&query), "jobs.cancel")
            .await
        {
            Ok(_) => {
                info!("BigQuery job cancelled: {}", job_id);
                Ok(())
            }
            Err(e) => {
                warn!("BigQuery cancel for {} failed: {}", job_id, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_cell_types() {
        assert_eq!(
            BigQueryWarehouse::convert_cell("INTEGER", json!("42")),
            json!(42)
        );
        assert_eq!(
            BigQueryWarehouse::convert_cell("FLOAT64", json!("1.5")),
            json!(1.5)
        );
        assert_eq!(
            BigQueryWarehouse::convert_cell("BOOL", json!("true")),
            json!(true)
        );
        assert_eq!(
            BigQueryWarehouse::convert_cell("DATE", json!("1600-01-01")),
            json!("1600-01-01")
        );
        assert_eq!(BigQueryWarehouse::convert_cell("INT64", Value::Null), Value::Null);
    }

    #[test]
    fn test_page_from_results_response() {
        let raw = json!({
            "jobComplete": true,
            "schema": {"fields": [
                {"name": "corpus", "type": "STRING"},
                {"name": "total", "type": "INTEGER"}
            ]},
            "rows": [{"f": [{"v": "hamlet"}, {"v": "32446"}]}],
            "pageToken": "abc",
            "totalBytesProcessed": "2048"
        });
        let parsed: QueryResultsResponse = serde_json::from_value(raw).unwrap();
        let page = BigQueryWarehouse::to_page(parsed);
        assert!(page.complete);
        assert_eq!(page.columns, vec!["corpus", "total"]);
        assert_eq!(page.rows[0]["total"], json!(32446));
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
        assert_eq!(page.bytes_processed, Some(2048));
    }

    #[test]
    fn test_incomplete_job_yields_empty_page() {
        let parsed: QueryResultsResponse =
            serde_json::from_value(json!({"jobComplete": false})).unwrap();
        let page = BigQueryWarehouse::to_page(parsed);
        assert!(!page.complete);
        assert!(page.rows.is_empty());
    }

    #[test]
    fn test_status_classification() {
        let err = BigQueryWarehouse::status_error(StatusCode::SERVICE_UNAVAILABLE, "busy", "x");
        assert!(err.is_retryable());

        let err = BigQueryWarehouse::status_error(StatusCode::BAD_REQUEST, "syntax", "x");
        assert!(matches!(err, NlSqlError::Execution(_)));

        let body = r#"{"error":{"message":"Query exceeded limit for bytes billed","errors":[{"reason":"bytesBilledLimitExceeded"}]}}"#;
        let err = BigQueryWarehouse::status_error(StatusCode::BAD_REQUEST, body, "x");
        assert!(matches!(
            err,
            NlSqlError::ResourceLimitExceeded {
                limit: ResourceLimit::BytesScanned,
                ..
            }
        ));
    }

    #[test]
    fn test_table_existence_from_status() {
        assert!(BigQueryWarehouse::existence_from_status(StatusCode::OK, "").unwrap());
        let body = r#"{"error":{"message":"Not found: Table p:d.missing"}}"#;
        assert!(!BigQueryWarehouse::existence_from_status(StatusCode::NOT_FOUND, body).unwrap());

        // A 404 in the message of some other failure is not a missing table.
        let body = r#"{"error":{"message":"Access Denied: dataset 404_archive"}}"#;
        let err =
            BigQueryWarehouse::existence_from_status(StatusCode::FORBIDDEN, body).unwrap_err();
        assert!(matches!(err, NlSqlError::Execution(_)));

        let err = BigQueryWarehouse::existence_from_status(StatusCode::BAD_GATEWAY, "").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_credentials_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("token.json");
        std::fs::write(&json_path, r#"{"access_token": "ya29.token"}"#).unwrap();
        match BigQueryWarehouse::read_credentials(json_path.to_str().unwrap()).unwrap() {
            Credentials::Bearer(token) => assert_eq!(token.expose(), "ya29.token"),
            Credentials::ServiceAccount(_) => panic!("expected a bearer token"),
        }

        let raw_path = dir.path().join("token.txt");
        std::fs::write(&raw_path, "ya29.raw\n").unwrap();
        match BigQueryWarehouse::read_credentials(raw_path.to_str().unwrap()).unwrap() {
            Credentials::Bearer(token) => assert_eq!(token.expose(), "ya29.raw"),
            Credentials::ServiceAccount(_) => panic!("expected a bearer token"),
        }

        let empty_path = dir.path().join("empty.json");
        std::fs::write(&empty_path, r#"{"project_id": "p"}"#).unwrap();
        assert!(BigQueryWarehouse::read_credentials(empty_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn test_broken_service_account_key_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let sa_path = dir.path().join("sa.json");
        std::fs::write(
            &sa_path,
            r#"{"type": "service_account", "client_email": "bot@p.iam.gserviceaccount.com"}"#,
        )
        .unwrap();
        let err = BigQueryWarehouse::read_credentials(sa_path.to_str().unwrap())
            .err()
            .unwrap();
        match err {
            NlSqlError::Configuration(msg) => assert!(msg.contains("service-account key")),
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }
}
