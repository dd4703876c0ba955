//! Value types carried by the pipeline state

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Column metadata discovered by schema introspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_values: Vec<serde_json::Value>,
}

/// Foreign-key style link from one table's columns to another table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub columns: Vec<String>,
    pub references_table: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references_columns: Vec<String>,
}

/// Table schema information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub row_count: usize,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            name: name.into(),
            columns,
            relationships: Vec::new(),
            row_count: 0,
        }
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Description of every table available to the translator, keyed by table name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub tables: BTreeMap<String, TableSchema>,
}

impl SchemaDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: TableSchema) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    /// Case-insensitive table lookup
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables
            .get(name)
            .or_else(|| self.tables.values().find(|t| t.name.eq_ignore_ascii_case(name)))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Format schema as markdown for inclusion in model prompts
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        for table in self.tables.values() {
            md.push_str(&format!("## Table: `{}` ({} rows)\n\n", table.name, table.row_count));
            md.push_str("| Column | Type | Nullable | Sample Values |\n");
            md.push_str("|--------|------|----------|---------------|\n");

            for col in &table.columns {
                let nullable = if col.nullable { "yes" } else { "" };
                let samples: Vec<String> = col
                    .sample_values
                    .iter()
                    .take(3)
                    .map(|v| match v {
                        serde_json::Value::String(s) => format!("\"{}\"", s),
                        _ => v.to_string(),
                    })
                    .collect();

                md.push_str(&format!(
                    "| `{}` | {} | {} | {} |\n",
                    col.name,
                    col.data_type,
                    nullable,
                    samples.join(", ")
                ));
            }

            for rel in &table.relationships {
                md.push_str(&format!(
                    "\nForeign key: ({}) references `{}`({})\n",
                    rel.columns.join(", "),
                    rel.references_table,
                    rel.references_columns.join(", ")
                ));
            }

            md.push('\n');
        }

        md
    }
}

/// Output of the natural-language translator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    pub sql_query: String,
    pub explanation: String,
    pub confidence: f64,
}

/// Validator's coarse safety classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Low => write!(f, "LOW"),
            RiskTier::Medium => write!(f, "MEDIUM"),
            RiskTier::High => write!(f, "HIGH"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub risk_tier: RiskTier,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub should_execute: bool,
}

impl ValidationReport {
    /// A clean, low-risk verdict
    pub fn approved() -> Self {
        Self {
            valid: true,
            risk_tier: RiskTier::Low,
            issues: Vec::new(),
            suggestions: Vec::new(),
            should_execute: true,
        }
    }

    pub fn rejected(risk_tier: RiskTier, issue: impl Into<String>) -> Self {
        Self {
            valid: false,
            risk_tier,
            issues: vec![issue.into()],
            suggestions: Vec::new(),
            should_execute: false,
        }
    }
}

/// Candidate query proposed by the alternative generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alternative {
    pub query: String,
    pub explanation: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
}

/// Rows are JSON objects keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub row_count: usize,
    #[serde(default)]
    pub columns: Vec<ColumnMeta>,
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn succeeded(columns: Vec<ColumnMeta>, rows: Vec<Row>, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            row_count: rows.len(),
            rows,
            error: None,
            execution_time_ms,
            columns,
            truncated: false,
        }
    }

    /// Failure or refusal reported by the executor
    pub fn failed(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            execution_time_ms,
            ..Self::default()
        }
    }
}

/// Tabular rendering of a result set
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableView {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl TableView {
    /// Project rows onto the column order of the result
    pub fn from_result(result: &ExecutionResult) -> Self {
        let columns: Vec<String> = if result.columns.is_empty() {
            result
                .rows
                .first()
                .map(|r| r.keys().cloned().collect())
                .unwrap_or_default()
        } else {
            result.columns.iter().map(|c| c.name.clone()).collect()
        };

        let rows = result
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(serde_json::Value::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
    Scatter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartView {
    pub kind: ChartKind,
    pub title: String,
    pub x_column: String,
    pub y_columns: Vec<String>,
}

/// Human-readable answer plus visualizations
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResponse {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableView>,
    #[serde(default)]
    pub charts: Vec<ChartView>,
}

impl FinalResponse {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }
}
