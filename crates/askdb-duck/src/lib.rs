//! DuckDB-backed schema service and query executor

use askdb_pipeline::CollaboratorError;
use duckdb::{AccessMode, Config, Connection};
use std::path::Path;
use thiserror::Error;

mod catalog;
mod executor;
pub mod value;

pub use catalog::{DuckSchemaService, DEFAULT_SAMPLE_ROWS};
pub use executor::{DuckQueryExecutor, DEFAULT_MAX_ROWS, DEFAULT_TIMEOUT};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("query timed out after {0} ms")]
    Timeout(u64),

    #[error("database task failed: {0}")]
    Task(String),
}

impl From<ExecutorError> for CollaboratorError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Task(msg) => CollaboratorError::Unavailable(msg),
            other => CollaboratorError::Other(Box::new(other)),
        }
    }
}

/// Open a database file without write access
pub(crate) fn open_read_only(path: &Path) -> Result<Connection, ExecutorError> {
    let config = Config::default().access_mode(AccessMode::ReadOnly)?;
    Ok(Connection::open_with_flags(path, config)?)
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
