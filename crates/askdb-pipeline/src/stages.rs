//! Stage functions
//!
//! Every stage reads the current state and returns a partial update. Stages
//! never panic on missing input and never return errors: precondition and
//! collaborator failures become an `error` field prefixed with the stage name.

use askdb_state::{sql, Alternative, PipelineState, StageName, StateUpdate, MAX_RETRIES};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::collaborators::{
    AlternativeGenerator, Interpreter, QueryExecutor, QueryValidator, SchemaService, Translator,
};
use crate::progress::ProgressHandle;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    async fn run(&self, state: &PipelineState, progress: &ProgressHandle) -> StateUpdate;
}

fn failed(stage: StageName, cause: impl Display) -> StateUpdate {
    StateUpdate::error(format!("{} failed: {}", stage, cause))
}

pub struct SchemaLoadStage {
    service: Arc<dyn SchemaService>,
}

impl SchemaLoadStage {
    pub fn new(service: Arc<dyn SchemaService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Stage for SchemaLoadStage {
    fn name(&self) -> StageName {
        StageName::SchemaLoad
    }

    async fn run(&self, _state: &PipelineState, progress: &ProgressHandle) -> StateUpdate {
        match self.service.load_schema().await {
            Ok(schema) => {
                progress.processing(
                    self.name(),
                    format!("Discovered {} tables", schema.tables.len()),
                    Some(json!({ "tables": schema.table_names().collect::<Vec<_>>() })),
                );
                StateUpdate {
                    schema: Some(schema),
                    ..StateUpdate::default()
                }
            }
            Err(e) => failed(self.name(), e),
        }
    }
}

pub struct TranslateStage {
    translator: Arc<dyn Translator>,
}

impl TranslateStage {
    pub fn new(translator: Arc<dyn Translator>) -> Self {
        Self { translator }
    }
}

#[async_trait]
impl Stage for TranslateStage {
    fn name(&self) -> StageName {
        StageName::Translate
    }

    async fn run(&self, state: &PipelineState, _progress: &ProgressHandle) -> StateUpdate {
        // SchemaLoad always hands over to Translate; carry its failure forward
        let Some(schema) = &state.schema else {
            return match state.error.as_deref().filter(|e| !e.is_empty()) {
                Some(cause) => failed(
                    self.name(),
                    format!("database schema has not been loaded ({})", cause),
                ),
                None => failed(self.name(), "database schema has not been loaded"),
            };
        };

        let translation = match self.translator.translate(state.question(), schema).await {
            Ok(t) => t,
            Err(e) => return failed(self.name(), e),
        };

        let query = sql::normalize(&translation.sql_query);
        if !sql::is_read_only(&query) {
            return failed(self.name(), "generated query is not a read-only statement");
        }
        if !(0.0..=100.0).contains(&translation.confidence) {
            return failed(
                self.name(),
                format!("confidence {} is outside 0..=100", translation.confidence),
            );
        }

        StateUpdate {
            sql_query: Some(query),
            query_explanation: Some(translation.explanation),
            confidence: Some(translation.confidence),
            ..StateUpdate::default()
        }
    }
}

pub struct ValidateStage {
    validator: Arc<dyn QueryValidator>,
}

impl ValidateStage {
    pub fn new(validator: Arc<dyn QueryValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> StageName {
        StageName::Validate
    }

    async fn run(&self, state: &PipelineState, progress: &ProgressHandle) -> StateUpdate {
        let (Some(query), Some(schema)) = (&state.sql_query, &state.schema) else {
            return failed(self.name(), "no SQL query and schema to validate");
        };
        let explanation = state.query_explanation.as_deref().unwrap_or_default();

        match self
            .validator
            .validate(query, state.question(), schema, explanation)
            .await
        {
            Ok(report) => {
                if !report.issues.is_empty() {
                    progress.processing(
                        self.name(),
                        format!("Validator reported {} issue(s)", report.issues.len()),
                        Some(json!({ "issues": report.issues })),
                    );
                }
                StateUpdate {
                    validation: Some(report),
                    ..StateUpdate::default()
                }
            }
            Err(e) => failed(self.name(), e),
        }
    }
}

/// Best-effort search for a higher-confidence query; never fails the run
pub struct ExperimentStage {
    generator: Arc<dyn AlternativeGenerator>,
}

impl ExperimentStage {
    pub fn new(generator: Arc<dyn AlternativeGenerator>) -> Self {
        Self { generator }
    }
}

/// First candidate with the highest confidence
fn best_alternative(candidates: &[Alternative]) -> Option<&Alternative> {
    candidates.iter().fold(None, |best: Option<&Alternative>, candidate| match best {
        Some(b) if candidate.confidence <= b.confidence => Some(b),
        _ => Some(candidate),
    })
}

#[async_trait]
impl Stage for ExperimentStage {
    fn name(&self) -> StageName {
        StageName::Experiment
    }

    async fn run(&self, state: &PipelineState, progress: &ProgressHandle) -> StateUpdate {
        let (Some(query), Some(schema)) = (&state.sql_query, &state.schema) else {
            return StateUpdate::empty();
        };

        let generation = self
            .generator
            .generate_alternatives(query, state.question(), schema);

        let generated = match AssertUnwindSafe(generation).catch_unwind().await {
            Ok(Ok(alternatives)) => alternatives,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Alternative generation failed; keeping original query");
                return StateUpdate::empty();
            }
            Err(_) => {
                tracing::warn!("Alternative generator panicked; keeping original query");
                return StateUpdate::empty();
            }
        };

        let candidates: Vec<Alternative> = generated
            .into_iter()
            .map(|alt| Alternative {
                query: sql::normalize(&alt.query),
                ..alt
            })
            .filter(|alt| sql::is_read_only(&alt.query))
            .filter(|alt| (0.0..=100.0).contains(&alt.confidence))
            .collect();

        progress.processing(
            self.name(),
            format!("Generated {} usable alternative(s)", candidates.len()),
            None,
        );

        let mut update = StateUpdate::default();
        let current = state.confidence.unwrap_or(0.0);

        if let Some(best) = best_alternative(&candidates) {
            if best.confidence > current {
                tracing::info!(
                    from = current,
                    to = best.confidence,
                    "Replacing query with higher-confidence alternative"
                );
                update.sql_query = Some(best.query.clone());
                update.query_explanation = Some(best.explanation.clone());
                update.confidence = Some(best.confidence);
            }
        }

        update.alternatives = Some(candidates);
        update
    }
}

pub struct ExecuteStage {
    executor: Arc<dyn QueryExecutor>,
}

impl ExecuteStage {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Stage for ExecuteStage {
    fn name(&self) -> StageName {
        StageName::Execute
    }

    async fn run(&self, state: &PipelineState, _progress: &ProgressHandle) -> StateUpdate {
        let (Some(query), Some(validation)) = (&state.sql_query, &state.validation) else {
            return failed(self.name(), "query has not been validated");
        };

        match self
            .executor
            .execute(query, validation.valid, validation.risk_tier)
            .await
        {
            Ok(result) if result.success => StateUpdate {
                execution_result: Some(result),
                ..StateUpdate::default()
            },
            Ok(result) => {
                let reason = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "executor reported failure".to_string());
                StateUpdate {
                    execution_result: Some(result),
                    ..failed(self.name(), reason)
                }
            }
            Err(e) => failed(self.name(), e),
        }
    }
}

pub struct InterpretStage {
    interpreter: Arc<dyn Interpreter>,
}

impl InterpretStage {
    pub fn new(interpreter: Arc<dyn Interpreter>) -> Self {
        Self { interpreter }
    }
}

#[async_trait]
impl Stage for InterpretStage {
    fn name(&self) -> StageName {
        StageName::Interpret
    }

    async fn run(&self, state: &PipelineState, _progress: &ProgressHandle) -> StateUpdate {
        let (Some(result), Some(query)) = (&state.execution_result, &state.sql_query) else {
            return failed(self.name(), "no execution result to interpret");
        };
        if !result.success {
            return failed(self.name(), "execution did not succeed");
        }

        match self
            .interpreter
            .interpret(state.question(), query, result)
            .await
        {
            Ok(response) => StateUpdate {
                final_response: Some(response),
                ..StateUpdate::default()
            },
            Err(e) => failed(self.name(), e),
        }
    }
}

/// Terminal failure sink; counts the retry but does not re-enter the graph
#[derive(Debug, Default)]
pub struct HandleErrorStage;

#[async_trait]
impl Stage for HandleErrorStage {
    fn name(&self) -> StageName {
        StageName::HandleError
    }

    async fn run(&self, state: &PipelineState, _progress: &ProgressHandle) -> StateUpdate {
        let retry_count = state.retry_count + 1;
        let original = state
            .error
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "pipeline ended without a result".to_string());

        let error = if retry_count > MAX_RETRIES {
            format!("Maximum retries exceeded ({}): {}", MAX_RETRIES, original)
        } else {
            original
        };

        StateUpdate {
            error: Some(error),
            retry_count: Some(retry_count),
            ..StateUpdate::default()
        }
    }
}
