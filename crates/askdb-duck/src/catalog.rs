//! Schema introspection for a DuckDB database file

use askdb_pipeline::{CollaboratorError, SchemaService};
use askdb_state::{ColumnInfo, Relationship, Row, SchemaDescription, TableSchema};
use async_trait::async_trait;
use duckdb::{Connection, Result as DuckResult};
use std::path::{Path, PathBuf};

use crate::value::value_to_json;
use crate::{open_read_only, quote_ident, ExecutorError};

/// Sample rows collected per table unless configured otherwise
pub const DEFAULT_SAMPLE_ROWS: usize = 3;

/// Describes every table in the `main` schema of a database file
#[derive(Debug, Clone)]
pub struct DuckSchemaService {
    database: PathBuf,
    sample_rows: usize,
}

impl DuckSchemaService {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            sample_rows: DEFAULT_SAMPLE_ROWS,
        }
    }

    pub fn with_sample_rows(mut self, sample_rows: usize) -> Self {
        self.sample_rows = sample_rows;
        self
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    /// Synchronous introspection; `load_schema` runs this on the blocking pool
    pub fn describe(&self) -> Result<SchemaDescription, ExecutorError> {
        let conn = open_read_only(&self.database)?;

        let mut stmt = conn.prepare(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'main' ORDER BY table_name",
        )?;
        let table_names: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<DuckResult<Vec<_>>>()?;

        let mut schema = SchemaDescription::new();
        for table_name in table_names {
            match describe_table(&conn, &table_name, self.sample_rows) {
                Ok(table) => schema.add_table(table),
                Err(e) => {
                    tracing::warn!(table = %table_name, error = %e, "Skipping table that failed introspection");
                }
            }
        }

        match foreign_keys(&conn) {
            Ok(links) => {
                for (table_name, relationship) in links {
                    if let Some(table) = schema.tables.get_mut(&table_name) {
                        table.relationships.push(relationship);
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "Foreign key introspection unavailable"),
        }

        tracing::debug!(
            database = %self.database.display(),
            tables = schema.tables.len(),
            "Schema described"
        );
        Ok(schema)
    }
}

fn describe_table(conn: &Connection, table_name: &str, sample_rows: usize) -> DuckResult<TableSchema> {
    let mut stmt = conn.prepare(
        "SELECT column_name, data_type, is_nullable \
         FROM information_schema.columns \
         WHERE table_schema = 'main' AND table_name = ? \
         ORDER BY ordinal_position",
    )?;
    let columns: Vec<(String, String, String)> = stmt
        .query_map([table_name], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<DuckResult<Vec<_>>>()?;

    let quoted = quote_ident(table_name);
    let row_count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quoted), [], |row| {
        row.get(0)
    })?;

    let samples = if sample_rows > 0 {
        sample(conn, &quoted, &columns, sample_rows)?
    } else {
        Vec::new()
    };

    let columns = columns
        .into_iter()
        .map(|(name, data_type, is_nullable)| {
            let sample_values = samples
                .iter()
                .filter_map(|row| row.get(&name))
                .filter(|v| !v.is_null())
                .cloned()
                .collect();
            ColumnInfo {
                name,
                data_type,
                nullable: is_nullable == "YES",
                sample_values,
            }
        })
        .collect();

    Ok(TableSchema {
        row_count: usize::try_from(row_count).unwrap_or(0),
        ..TableSchema::new(table_name, columns)
    })
}

fn sample(
    conn: &Connection,
    quoted_table: &str,
    columns: &[(String, String, String)],
    limit: usize,
) -> DuckResult<Vec<Row>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {} LIMIT {}", quoted_table, limit))?;
    let rows = stmt.query_map([], |row| {
        let mut values = Row::new();
        for (idx, (name, _, _)) in columns.iter().enumerate() {
            values.insert(name.clone(), value_to_json(row.get_ref(idx)?));
        }
        Ok(values)
    })?;
    rows.collect()
}

/// `(owning table, relationship)` pairs for every declared foreign key
fn foreign_keys(conn: &Connection) -> DuckResult<Vec<(String, Relationship)>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, \
                array_to_string(constraint_column_names, ','), \
                referenced_table, \
                array_to_string(referenced_column_names, ',') \
         FROM duckdb_constraints() \
         WHERE constraint_type = 'FOREIGN KEY' AND schema_name = 'main'",
    )?;

    let split = |s: String| -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    };

    let links = stmt
        .query_map([], |row| {
            let table: String = row.get(0)?;
            let columns: String = row.get(1)?;
            let references_table: String = row.get(2)?;
            let references_columns: Option<String> = row.get(3)?;
            Ok((table, columns, references_table, references_columns))
        })?
        .collect::<DuckResult<Vec<_>>>()?;

    Ok(links
        .into_iter()
        .map(|(table, columns, references_table, references_columns)| {
            (
                table,
                Relationship {
                    columns: split(columns),
                    references_table,
                    references_columns: references_columns.map(split).unwrap_or_default(),
                },
            )
        })
        .collect())
}

#[async_trait]
impl SchemaService for DuckSchemaService {
    async fn load_schema(&self) -> Result<SchemaDescription, CollaboratorError> {
        let service = self.clone();
        let schema = tokio::task::spawn_blocking(move || service.describe())
            .await
            .map_err(|e| ExecutorError::Task(e.to_string()))??;
        Ok(schema)
    }
}
