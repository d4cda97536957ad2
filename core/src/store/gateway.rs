//! QuestDB gateway.
//!
//! Two wire surfaces, used for what each is good at: SQL statements go
//! through the HTTP `/exec` endpoint (synchronous, errors come back in
//! the response body), bulk event rows go through the influx line
//! protocol over TCP (fast, but fire-and-forget: the server applies
//! rows asynchronously, which is why the watermark barrier exists).

use async_trait::async_trait;
use monitord_protocol::DbParams;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::codec::StoreRow;
use crate::error::{MonitorError, Result};

/// Outcome of one `/exec` round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    /// DDL or DML acknowledged, no result set.
    Ack,
    /// Result set with column names and row values.
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    },
}

impl QueryOutput {
    /// First cell of the first row, for `select max(...)`-style queries.
    pub fn scalar(&self) -> Option<&serde_json::Value> {
        match self {
            QueryOutput::Rows { rows, .. } => rows.first().and_then(|r| r.first()),
            QueryOutput::Ack => None,
        }
    }
}

/// Narrow store surface, mockable for barrier and planner tests.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Run one SQL statement.
    async fn execute(&self, sql: &str) -> Result<QueryOutput>;

    /// Append event rows. May return before the rows are queryable.
    async fn insert_rows(&self, rows: &[StoreRow]) -> Result<()>;
}

/// Shape of the `/exec` JSON response we care about.
#[derive(Debug, serde::Deserialize)]
struct ExecResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ddl: Option<String>,
    #[serde(default)]
    columns: Option<Vec<ExecColumn>>,
    #[serde(default)]
    dataset: Option<Vec<Vec<serde_json::Value>>>,
}

#[derive(Debug, serde::Deserialize)]
struct ExecColumn {
    name: String,
}

pub struct QuestDbGateway {
    client: Client,
    exec_url: String,
    ilp_addr: String,
    user: String,
    password: String,
}

impl QuestDbGateway {
    pub fn new(params: &DbParams) -> Self {
        Self {
            client: Client::new(),
            exec_url: format!("http://{}:{}/exec", params.host, params.port_sql),
            ilp_addr: format!("{}:{}", params.host, params.port_influx),
            user: params.user.clone(),
            password: params.password.clone(),
        }
    }

    /// Override the `/exec` URL, for tests against a local HTTP stub.
    pub fn with_exec_url(mut self, url: impl Into<String>) -> Self {
        self.exec_url = url.into();
        self
    }
}

#[async_trait]
impl StoreGateway for QuestDbGateway {
    async fn execute(&self, sql: &str) -> Result<QueryOutput> {
        debug!(sql, "store exec");
        let response = self
            .client
            .get(&self.exec_url)
            .basic_auth(&self.user, Some(&self.password))
            .query(&[("query", sql)])
            .send()
            .await
            .map_err(|e| MonitorError::Store(e.to_string()))?;
        let body: ExecResponse = response
            .json()
            .await
            .map_err(|e| MonitorError::Store(e.to_string()))?;

        if let Some(error) = body.error {
            return Err(MonitorError::Store(error));
        }
        if body.ddl.is_some() {
            return Ok(QueryOutput::Ack);
        }
        match (body.columns, body.dataset) {
            (Some(columns), Some(rows)) => Ok(QueryOutput::Rows {
                columns: columns.into_iter().map(|c| c.name).collect(),
                rows,
            }),
            _ => Ok(QueryOutput::Ack),
        }
    }

    async fn insert_rows(&self, rows: &[StoreRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut payload = String::new();
        for row in rows {
            payload.push_str(&ilp_line(row));
        }
        trace!(rows = rows.len(), "ilp append");
        let mut stream = TcpStream::connect(&self.ilp_addr)
            .await
            .map_err(|e| MonitorError::Store(format!("ilp connect {}: {e}", self.ilp_addr)))?;
        stream
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| MonitorError::Store(format!("ilp write: {e}")))?;
        stream
            .shutdown()
            .await
            .map_err(|e| MonitorError::Store(format!("ilp shutdown: {e}")))?;
        Ok(())
    }
}

/// Render one row as an influx line: `table field=value,... timestamp_ns`.
/// Values that parse as integers get the `i` suffix, floats go bare, and
/// everything else becomes a quoted string so the server-side schema
/// stays authoritative.
fn ilp_line(row: &StoreRow) -> String {
    let mut line = escape_name(&row.table);
    line.push(' ');
    let mut first = true;
    for (name, value) in &row.columns {
        if !first {
            line.push(',');
        }
        first = false;
        line.push_str(&escape_name(name));
        line.push('=');
        line.push_str(&ilp_value(value));
    }
    let nanos = row.timestamp.timestamp_nanos_opt().unwrap_or_default();
    line.push(' ');
    line.push_str(&nanos.to_string());
    line.push('\n');
    line
}

fn ilp_value(value: &str) -> String {
    if value.parse::<i64>().is_ok() {
        return format!("{value}i");
    }
    if value.parse::<f64>().is_ok() {
        return value.to_string();
    }
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn escape_name(name: &str) -> String {
    name.replace(' ', "\\ ").replace(',', "\\,")
}
