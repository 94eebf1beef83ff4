//! The analytics source boundary.
//!
//! The engine treats query execution as a black box behind `AnalyticsSource`:
//! hand over an `AggregateRequest`, get rows or a typed failure. The
//! production implementation speaks the ClickHouse HTTP protocol with
//! JSONEachRow output; tests swap in `mock::MockSource`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::SourceConfig;
use crate::error::ReportError;
use crate::query::AggregateRequest;

/// One result row, as decoded from JSONEachRow output.
pub type Row = serde_json::Map<String, Value>;

#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    /// Execute one aggregation request under its declared ceilings.
    async fn execute(&self, request: &AggregateRequest) -> Result<Vec<Row>, ReportError>;
}

/// Read an integer column. JSONEachRow serializes UInt64 as a JSON string
/// when the value exceeds 2^53, so both encodings are accepted.
pub fn get_u64(row: &Row, key: &str) -> u64 {
    match row.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

pub fn get_f64(row: &Row, key: &str) -> f64 {
    match row.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub fn get_str<'a>(row: &'a Row, key: &str) -> Option<&'a str> {
    row.get(key).and_then(Value::as_str)
}

/// ClickHouse HTTP client. Requests POST the rendered SQL with the execution
/// ceilings passed as per-query settings in the URL.
pub struct ClickHouseSource {
    http: reqwest::Client,
    config: SourceConfig,
}

// ClickHouse server error codes surfaced in HTTP error bodies.
const CH_CODE_TIMEOUT: &str = "Code: 159";
const CH_CODE_MEMORY: &str = "Code: 241";

impl ClickHouseSource {
    pub fn new(config: SourceConfig) -> Result<Self, ReportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ReportError::Configuration(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, request: &AggregateRequest) -> Result<url::Url, ReportError> {
        let mut url = url::Url::parse(&self.config.url)
            .map_err(|e| ReportError::Configuration(format!("source url: {e}")))?;
        if self.config.secure && url.scheme() == "http" {
            url.set_scheme("https")
                .map_err(|_| ReportError::Configuration("source url rejects https".into()))?;
        }
        let limits = &request.limits;
        url.query_pairs_mut()
            .append_pair("database", &self.config.database)
            .append_pair(
                "max_execution_time",
                &limits.max_execution_time_secs.to_string(),
            )
            .append_pair("max_memory_usage", &limits.max_memory_bytes.to_string())
            .append_pair("max_threads", &limits.max_threads.to_string());
        Ok(url)
    }
}

/// Reduce a server error body to something safe to store and log. The body
/// can echo the full query text; keep only the leading exception line.
fn sanitize_server_error(body: &str) -> String {
    let first_line = body.lines().next().unwrap_or("").trim();
    let cut = first_line.find(": While executing").unwrap_or(first_line.len());
    let mut msg: String = first_line[..cut].chars().take(200).collect();
    if msg.is_empty() {
        msg = "unspecified server error".to_string();
    }
    msg
}

#[async_trait]
impl AnalyticsSource for ClickHouseSource {
    async fn execute(&self, request: &AggregateRequest) -> Result<Vec<Row>, ReportError> {
        let url = self.endpoint(request)?;
        let sql = format!("{}\nFORMAT JSONEachRow", request.to_sql());
        let ceiling = request.limits.max_execution_time_secs;

        log::debug!(
            "source query: metric={} org={}",
            request.kind,
            request.scope.org_id
        );

        let response = self
            .http
            .post(url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            // Grace beyond the server-side ceiling so the server times out
            // first and reports its own code.
            .timeout(Duration::from_secs(ceiling + 15))
            .body(sql)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReportError::SourceTimeout(ceiling)
                } else {
                    ReportError::Network(format!("source unreachable: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ReportError::Network(format!("source response: {e}")))?;

        if !status.is_success() {
            if body.contains(CH_CODE_TIMEOUT) {
                return Err(ReportError::SourceTimeout(ceiling));
            }
            if body.contains(CH_CODE_MEMORY) {
                return Err(ReportError::SourceResourceExceeded(sanitize_server_error(
                    &body,
                )));
            }
            return Err(ReportError::SourceQuery(sanitize_server_error(&body)));
        }

        let mut rows = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let row: Row = serde_json::from_str(line)
                .map_err(|e| ReportError::SourceQuery(format!("malformed result row: {e}")))?;
            rows.push(row);
        }
        Ok(rows)
    }
}

#[cfg(test)]
pub mod mock {
    //! Scripted in-memory source for tests.

    use std::sync::Mutex;

    use super::*;

    type Responder = Box<dyn Fn(&AggregateRequest) -> Result<Vec<Row>, ReportError> + Send + Sync>;

    pub struct MockSource {
        respond: Responder,
        /// (metric name, source node) per executed request, in order.
        pub seen: Mutex<Vec<(String, String)>>,
    }

    impl MockSource {
        pub fn new(
            respond: impl Fn(&AggregateRequest) -> Result<Vec<Row>, ReportError>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            Self {
                respond: Box::new(respond),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AnalyticsSource for MockSource {
        async fn execute(&self, request: &AggregateRequest) -> Result<Vec<Row>, ReportError> {
            self.seen.lock().unwrap().push((
                request.kind.name().to_string(),
                request.scope.source_node.clone(),
            ));
            (self.respond)(request)
        }
    }

    pub fn breakdown_rows(entries: &[(&str, u64)]) -> Vec<Row> {
        entries
            .iter()
            .map(|(label, count)| {
                serde_json::from_value(serde_json::json!({"label": label, "count": count}))
                    .unwrap()
            })
            .collect()
    }

    pub fn ratio_row(numerator: u64, denominator: u64) -> Vec<Row> {
        vec![serde_json::from_value(
            serde_json::json!({"numerator": numerator, "denominator": denominator}),
        )
        .unwrap()]
    }

    pub fn totals_row(total_calls: u64, total_duration: u64) -> Vec<Row> {
        vec![serde_json::from_value(
            serde_json::json!({"total_calls": total_calls, "total_duration": total_duration}),
        )
        .unwrap()]
    }

    pub fn value_rows(values: &[&str]) -> Vec<Row> {
        values
            .iter()
            .map(|v| serde_json::from_value(serde_json::json!({"value": v})).unwrap())
            .collect()
    }
}
