//! OpenAI-backed collaborators
//!
//! Every collaborator sends one system prompt plus a JSON payload and parses
//! a JSON object out of the reply. There is no retry loop here: a failed or
//! unparseable reply is reported to the pipeline, which decides what to do.

use askdb_pipeline::{
    AlternativeGenerator, CollaboratorError, Interpreter, QueryValidator, Translator,
};
use askdb_state::{
    sql, Alternative, ChartView, ExecutionResult, FinalResponse, RiskTier, SchemaDescription,
    TableView, Translation, ValidationReport,
};
use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Rows of the result shown to the interpreter model
const PREVIEW_ROWS: usize = 20;

const TRANSLATE_PROMPT: &str = r#"You translate questions about a DuckDB database into a single SQL query.

Rules:
1. Produce exactly one read-only statement: SELECT, or WITH ... SELECT.
2. Never modify data or schema (no INSERT, UPDATE, DELETE, DROP, ALTER, CREATE, COPY).
3. Use only the tables and columns listed in the schema. Quote identifiers that need it.
4. Prefer explicit column lists and give computed columns readable aliases.
5. Rate your confidence from 0 to 100 that the query answers the question exactly.

Respond with ONLY a JSON object:
{"sql": "<query>", "explanation": "<one or two sentences>", "confidence": <0-100>}"#;

const VALIDATE_PROMPT: &str = r#"You review a SQL query written for a DuckDB database before it runs.

Check that:
- every table and column exists in the schema,
- joins and filters match the question,
- the query is read-only and cannot be expensive by accident (missing join keys, cartesian products).

Classify the risk: LOW (safe, matches the question), MEDIUM (works but may be slow or imprecise), HIGH (unsafe or likely wrong).

Respond with ONLY a JSON object:
{"valid": true|false, "issues": ["..."], "suggestions": ["..."], "riskTier": "LOW"|"MEDIUM"|"HIGH", "shouldExecute": true|false}"#;

const ALTERNATIVES_PROMPT: &str = r#"You improve SQL queries written for a DuckDB database.

Given a question, the schema and a candidate query, propose up to three different read-only queries (SELECT or WITH) that may answer the question more accurately. Rate each from 0 to 100 on the same scale used for the candidate.

Respond with ONLY a JSON object:
{"alternatives": [{"query": "<sql>", "explanation": "<why it is better>", "confidence": <0-100>}]}"#;

const INTERPRET_PROMPT: &str = r#"You explain SQL query results to the person who asked the question.

Write a short, direct answer in plain language using the numbers in the result. Mention when the result was truncated. Suggest charts only when they help: kind is one of "bar", "line", "pie", "scatter", and xColumn/yColumns must be columns of the result.

Respond with ONLY a JSON object:
{"summary": "<answer>", "charts": [{"kind": "bar", "title": "...", "xColumn": "...", "yColumns": ["..."]}]}"#;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("OpenAI request failed: {0}")]
    Api(#[from] OpenAIError),

    #[error("model returned no content")]
    EmptyResponse,

    #[error("model reply is not the expected JSON: {0}")]
    Parse(String),
}

impl From<LlmError> for CollaboratorError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Api(api) => CollaboratorError::Unavailable(api.to_string()),
            other => CollaboratorError::InvalidResponse(other.to_string()),
        }
    }
}

/// The JSON object inside a model reply, tolerating Markdown fences and prose
pub fn extract_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (start < end).then(|| &content[start..=end])
}

fn parse_reply<T: DeserializeOwned>(content: &str) -> Result<T, LlmError> {
    let body = extract_json(content).ok_or_else(|| LlmError::Parse(truncate(content)))?;
    serde_json::from_str(body).map_err(|e| LlmError::Parse(format!("{}: {}", e, truncate(body))))
}

fn truncate(text: &str) -> String {
    const LIMIT: usize = 200;
    match text.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Chat model shared by every collaborator
#[derive(Clone)]
pub struct ChatModel {
    client: Client<OpenAIConfig>,
    model: String,
}

impl ChatModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self {
            client: Client::with_config(config),
            model: model.into(),
        }
    }

    async fn complete<T: DeserializeOwned>(
        &self,
        task: &'static str,
        system_prompt: &str,
        payload: serde_json::Value,
    ) -> Result<T, LlmError> {
        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt)
                    .build()?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(payload.to_string())
                    .build()?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .messages(messages)
            .temperature(0.0)
            .response_format(ResponseFormat::JsonObject)
            .build()?;

        let response = self.client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .ok_or(LlmError::EmptyResponse)?;

        tracing::debug!(task, model = %self.model, reply = %truncate(content), "LLM reply");
        parse_reply(content)
    }
}

#[derive(Debug, Deserialize)]
struct TranslationReply {
    sql: String,
    #[serde(default)]
    explanation: String,
    confidence: f64,
}

/// Natural-language question to SQL
pub struct OpenAiTranslator {
    model: ChatModel,
}

impl OpenAiTranslator {
    pub fn new(model: ChatModel) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Translator for OpenAiTranslator {
    async fn translate(
        &self,
        question: &str,
        schema: &SchemaDescription,
    ) -> Result<Translation, CollaboratorError> {
        if question.trim().is_empty() {
            return Err(CollaboratorError::rejected("question is empty"));
        }

        let reply: TranslationReply = self
            .model
            .complete(
                "translate",
                TRANSLATE_PROMPT,
                json!({ "question": question, "schema": schema.to_markdown() }),
            )
            .await?;

        Ok(Translation {
            sql_query: reply.sql,
            explanation: reply.explanation,
            confidence: reply.confidence,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidationReply {
    valid: bool,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
    #[serde(default)]
    risk_tier: String,
    #[serde(default)]
    should_execute: bool,
}

/// Unknown tiers are treated as the most restrictive
fn parse_risk_tier(value: &str) -> RiskTier {
    match value.trim().to_ascii_uppercase().as_str() {
        "LOW" => RiskTier::Low,
        "MEDIUM" => RiskTier::Medium,
        _ => RiskTier::High,
    }
}

/// Overlay checks that do not depend on the model's judgement
fn static_check(query: &str, schema: &SchemaDescription, mut report: ValidationReport) -> ValidationReport {
    if !sql::is_read_only(query) {
        report.valid = false;
        report.risk_tier = RiskTier::High;
        report.should_execute = false;
        report
            .issues
            .push("query is not a single read-only SELECT/WITH statement".to_string());
    }

    for table in sql::referenced_tables(query) {
        if schema.table(&table).is_none() {
            report.valid = false;
            report.issues.push(format!("unknown table: {}", table));
        }
    }

    report
}

#[derive(Debug, Deserialize)]
struct AlternativesReply {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

/// SQL review and alternative generation
pub struct OpenAiValidator {
    model: ChatModel,
}

impl OpenAiValidator {
    pub fn new(model: ChatModel) -> Self {
        Self { model }
    }
}

#[async_trait]
impl QueryValidator for OpenAiValidator {
    async fn validate(
        &self,
        query: &str,
        question: &str,
        schema: &SchemaDescription,
        explanation: &str,
    ) -> Result<ValidationReport, CollaboratorError> {
        let reply: ValidationReply = self
            .model
            .complete(
                "validate",
                VALIDATE_PROMPT,
                json!({
                    "question": question,
                    "sql": query,
                    "explanation": explanation,
                    "schema": schema.to_markdown(),
                }),
            )
            .await?;

        let report = ValidationReport {
            valid: reply.valid,
            risk_tier: parse_risk_tier(&reply.risk_tier),
            issues: reply.issues,
            suggestions: reply.suggestions,
            should_execute: reply.should_execute,
        };
        Ok(static_check(query, schema, report))
    }
}

#[async_trait]
impl AlternativeGenerator for OpenAiValidator {
    async fn generate_alternatives(
        &self,
        query: &str,
        question: &str,
        schema: &SchemaDescription,
    ) -> Result<Vec<Alternative>, CollaboratorError> {
        let reply: AlternativesReply = self
            .model
            .complete(
                "alternatives",
                ALTERNATIVES_PROMPT,
                json!({ "question": question, "sql": query, "schema": schema.to_markdown() }),
            )
            .await?;
        Ok(reply.alternatives)
    }
}

#[derive(Debug, Deserialize)]
struct InterpretationReply {
    summary: String,
    #[serde(default)]
    charts: Vec<ChartView>,
}

/// Drop charts that reference columns the result does not have
fn usable_charts(charts: Vec<ChartView>, table: &TableView) -> Vec<ChartView> {
    let known = |c: &String| table.columns.iter().any(|col| col == c);
    charts
        .into_iter()
        .filter(|chart| known(&chart.x_column) && !chart.y_columns.is_empty())
        .filter(|chart| chart.y_columns.iter().all(known))
        .collect()
}

/// Result set to human-readable answer
pub struct OpenAiInterpreter {
    model: ChatModel,
}

impl OpenAiInterpreter {
    pub fn new(model: ChatModel) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Interpreter for OpenAiInterpreter {
    async fn interpret(
        &self,
        question: &str,
        query: &str,
        result: &ExecutionResult,
    ) -> Result<FinalResponse, CollaboratorError> {
        let table = TableView::from_result(result);
        let preview: Vec<_> = result.rows.iter().take(PREVIEW_ROWS).collect();

        let reply: InterpretationReply = self
            .model
            .complete(
                "interpret",
                INTERPRET_PROMPT,
                json!({
                    "question": question,
                    "sql": query,
                    "columns": result.columns,
                    "rowCount": result.row_count,
                    "truncated": result.truncated,
                    "rows": preview,
                }),
            )
            .await?;

        Ok(FinalResponse {
            summary: reply.summary,
            charts: usable_charts(reply.charts, &table),
            table: Some(table),
        })
    }
}
