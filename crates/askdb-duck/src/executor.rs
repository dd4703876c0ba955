//! Bounded, read-only query execution

use askdb_pipeline::{CollaboratorError, QueryExecutor};
use askdb_state::{sql, ColumnMeta, ExecutionResult, RiskTier, Row};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::value::value_to_json;
use crate::{open_read_only, ExecutorError};

pub const DEFAULT_MAX_ROWS: usize = 1000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes validated read-only queries against a database file
///
/// Every query gets its own read-only connection, so concurrent runs never
/// share a connection and a query can never write.
#[derive(Debug, Clone)]
pub struct DuckQueryExecutor {
    database: PathBuf,
    max_rows: usize,
    timeout: Duration,
}

struct Fetched {
    columns: Vec<ColumnMeta>,
    rows: Vec<Row>,
    truncated: bool,
}

impl DuckQueryExecutor {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            max_rows: DEFAULT_MAX_ROWS,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    /// Reason a query must not run, if any
    fn refusal(sql: &str, validated: bool, risk_tier: RiskTier) -> Option<&'static str> {
        if !validated {
            Some("query was not validated")
        } else if risk_tier == RiskTier::High {
            Some("risk tier HIGH queries are not executed")
        } else if !sql::is_read_only(sql) {
            Some("only read-only SELECT/WITH statements may be executed")
        } else {
            None
        }
    }
}

fn fetch(database: &Path, query: &str, max_rows: usize) -> Result<Fetched, ExecutorError> {
    let conn = open_read_only(database)?;
    let mut stmt = conn.prepare(query)?;
    let mut rows = stmt.query([])?;

    let columns: Vec<ColumnMeta> = match rows.as_ref() {
        Some(stmt) => (0..stmt.column_count())
            .map(|i| ColumnMeta {
                name: stmt
                    .column_name(i)
                    .map_or_else(|_| format!("column{}", i), |n| n.to_string()),
                data_type: stmt.column_type(i).to_string(),
            })
            .collect(),
        None => Vec::new(),
    };

    let mut fetched = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if fetched.len() == max_rows {
            truncated = true;
            break;
        }
        let mut values = Row::new();
        for (idx, column) in columns.iter().enumerate() {
            values.insert(column.name.clone(), value_to_json(row.get_ref(idx)?));
        }
        fetched.push(values);
    }

    Ok(Fetched {
        columns,
        rows: fetched,
        truncated,
    })
}

/// Run blocking work on the blocking pool, giving up after `timeout`
///
/// The abandoned task keeps its read-only connection until DuckDB returns.
pub(crate) async fn blocking_with_timeout<T, F>(timeout: Duration, work: F) -> Result<T, ExecutorError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ExecutorError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ExecutorError::Task(join.to_string())),
        Err(_) => Err(ExecutorError::Timeout(timeout.as_millis() as u64)),
    }
}

#[async_trait]
impl QueryExecutor for DuckQueryExecutor {
    async fn execute(
        &self,
        query: &str,
        validated: bool,
        risk_tier: RiskTier,
    ) -> Result<ExecutionResult, CollaboratorError> {
        if let Some(reason) = Self::refusal(query, validated, risk_tier) {
            tracing::info!(risk_tier = %risk_tier, validated, "Refusing query: {}", reason);
            return Ok(ExecutionResult::failed(reason, 0));
        }

        let started = Instant::now();
        let database = self.database.clone();
        let owned = query.to_string();
        let max_rows = self.max_rows;

        let outcome =
            blocking_with_timeout(self.timeout, move || fetch(&database, &owned, max_rows)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(fetched) => {
                tracing::debug!(
                    rows = fetched.rows.len(),
                    truncated = fetched.truncated,
                    elapsed_ms,
                    "Query executed"
                );
                let mut result = ExecutionResult::succeeded(fetched.columns, fetched.rows, elapsed_ms);
                result.truncated = fetched.truncated;
                Ok(result)
            }
            Err(ExecutorError::Task(msg)) => Err(CollaboratorError::Unavailable(msg)),
            Err(e) => {
                tracing::warn!(error = %e, elapsed_ms, "Query failed");
                Ok(ExecutionResult::failed(e.to_string(), elapsed_ms))
            }
        }
    }
}
