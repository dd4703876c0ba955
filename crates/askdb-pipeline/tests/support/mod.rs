//! Scripted collaborators for driving the pipeline without a database or model

#![allow(dead_code)]

use askdb_pipeline::{
    AlternativeGenerator, CollaboratorError, Collaborators, Interpreter, QueryExecutor,
    QueryValidator, SchemaService, Translator,
};
use askdb_state::{
    Alternative, ColumnInfo, ColumnMeta, ExecutionResult, FinalResponse, RiskTier, Row,
    SchemaDescription, TableSchema, TableView, Translation, ValidationReport,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub enum Execution {
    Rows(Vec<Row>),
    Fail(String),
    Panic,
}

pub struct Scripted {
    pub schema: Option<SchemaDescription>,
    pub translation: Option<Translation>,
    pub validation: ValidationReport,
    pub alternatives: Option<Vec<Alternative>>,
    pub generator_panics: bool,
    pub execution: Execution,
    pub generator_calls: AtomicUsize,
    pub executed: Mutex<Vec<String>>,
}

pub fn orders_schema() -> SchemaDescription {
    SchemaDescription::new().with_table(TableSchema {
        row_count: 5,
        ..TableSchema::new(
            "orders",
            vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: "INTEGER".into(),
                    nullable: false,
                    sample_values: vec![json!(1)],
                },
                ColumnInfo {
                    name: "total".into(),
                    data_type: "DOUBLE".into(),
                    nullable: true,
                    sample_values: vec![json!(9.5)],
                },
            ],
        )
    })
}

pub fn count_row(n: i64) -> Row {
    let mut row = Row::new();
    row.insert("n".to_string(), json!(n));
    row
}

impl Scripted {
    /// Happy path: "count rows in orders" at the given confidence
    pub fn answering(confidence: f64) -> Self {
        Self {
            schema: Some(orders_schema()),
            translation: Some(Translation {
                sql_query: "SELECT COUNT(*) AS n FROM orders".into(),
                explanation: "Counts every order".into(),
                confidence,
            }),
            validation: ValidationReport::approved(),
            alternatives: Some(Vec::new()),
            generator_panics: false,
            execution: Execution::Rows(vec![count_row(5)]),
            generator_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_alternatives(mut self, alternatives: &[(&str, f64)]) -> Self {
        self.alternatives = Some(
            alternatives
                .iter()
                .map(|(query, confidence)| Alternative {
                    query: query.to_string(),
                    explanation: format!("variant at {}", confidence),
                    confidence: *confidence,
                })
                .collect(),
        );
        self
    }

    pub fn with_panicking_generator(mut self) -> Self {
        self.generator_panics = true;
        self
    }

    pub fn into_collaborators(self) -> (Arc<Self>, Collaborators) {
        let shared = Arc::new(self);
        let collaborators = Collaborators {
            schema: shared.clone(),
            translator: shared.clone(),
            validator: shared.clone(),
            alternatives: shared.clone(),
            executor: shared.clone(),
            interpreter: shared.clone(),
        };
        (shared, collaborators)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchemaService for Scripted {
    async fn load_schema(&self) -> Result<SchemaDescription, CollaboratorError> {
        self.schema
            .clone()
            .ok_or_else(|| CollaboratorError::Unavailable("database is offline".into()))
    }
}

#[async_trait]
impl Translator for Scripted {
    async fn translate(
        &self,
        _question: &str,
        _schema: &SchemaDescription,
    ) -> Result<Translation, CollaboratorError> {
        self.translation
            .clone()
            .ok_or_else(|| CollaboratorError::Unavailable("model quota exhausted".into()))
    }
}

#[async_trait]
impl QueryValidator for Scripted {
    async fn validate(
        &self,
        _sql: &str,
        _question: &str,
        _schema: &SchemaDescription,
        _explanation: &str,
    ) -> Result<ValidationReport, CollaboratorError> {
        Ok(self.validation.clone())
    }
}

#[async_trait]
impl AlternativeGenerator for Scripted {
    async fn generate_alternatives(
        &self,
        _sql: &str,
        _question: &str,
        _schema: &SchemaDescription,
    ) -> Result<Vec<Alternative>, CollaboratorError> {
        self.generator_calls.fetch_add(1, Ordering::SeqCst);
        if self.generator_panics {
            panic!("alternative model returned garbage");
        }
        self.alternatives
            .clone()
            .ok_or_else(|| CollaboratorError::InvalidResponse("not JSON".into()))
    }
}

#[async_trait]
impl QueryExecutor for Scripted {
    async fn execute(
        &self,
        sql: &str,
        validated: bool,
        risk_tier: RiskTier,
    ) -> Result<ExecutionResult, CollaboratorError> {
        if !validated {
            return Ok(ExecutionResult::failed("query was not validated", 0));
        }
        if risk_tier == RiskTier::High {
            return Ok(ExecutionResult::failed("risk tier HIGH queries are not executed", 0));
        }

        self.executed.lock().unwrap().push(sql.to_string());
        match &self.execution {
            Execution::Rows(rows) => Ok(ExecutionResult::succeeded(
                vec![ColumnMeta {
                    name: "n".into(),
                    data_type: "BIGINT".into(),
                }],
                rows.clone(),
                4,
            )),
            Execution::Fail(message) => Ok(ExecutionResult::failed(message.clone(), 2)),
            Execution::Panic => panic!("executor connection poisoned"),
        }
    }
}

#[async_trait]
impl Interpreter for Scripted {
    async fn interpret(
        &self,
        _question: &str,
        _sql: &str,
        result: &ExecutionResult,
    ) -> Result<FinalResponse, CollaboratorError> {
        let summary = match result.rows.first().and_then(|r| r.get("n")) {
            Some(n) => format!("There are {} orders.", n),
            None => format!("{} row(s) returned", result.row_count),
        };
        Ok(FinalResponse {
            summary,
            table: Some(TableView::from_result(result)),
            charts: Vec::new(),
        })
    }
}
