//! Shared state threaded through one askdb pipeline run
//!
//! A `PipelineState` is created per question and grows monotonically: each
//! stage returns a `StateUpdate` and the state merges it through
//! [`PipelineState::apply`], which enforces which stage may write which field.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod sql;
mod types;
pub use types::*;

/// Retries above this count are reported as exhausted
pub const MAX_RETRIES: u32 = 2;

/// Finite set of pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    SchemaLoad,
    Translate,
    Validate,
    Experiment,
    Execute,
    Interpret,
    HandleError,
}

impl StageName {
    pub const ALL: [StageName; 7] = [
        StageName::SchemaLoad,
        StageName::Translate,
        StageName::Validate,
        StageName::Experiment,
        StageName::Execute,
        StageName::Interpret,
        StageName::HandleError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::SchemaLoad => "SchemaLoad",
            StageName::Translate => "Translate",
            StageName::Validate => "Validate",
            StageName::Experiment => "Experiment",
            StageName::Execute => "Execute",
            StageName::Interpret => "Interpret",
            StageName::HandleError => "HandleError",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("{stage} may not write field '{field}'")]
    FieldNotOwned { stage: StageName, field: &'static str },

    #[error("field '{0}' has already been written")]
    AlreadyWritten(&'static str),

    #[error("replacement confidence {candidate} does not exceed current confidence {current}")]
    ReplacementNotBetter { current: f64, candidate: f64 },

    #[error("confidence {0} is outside 0..=100")]
    InvalidConfidence(f64),

    #[error("final response requires a successful execution result")]
    InterpretWithoutSuccess,

    #[error("an existing error may not be cleared")]
    ErrorCleared,

    #[error("retry count must advance by one (current {current}, proposed {proposed})")]
    RetryCountSkipped { current: u32, proposed: u32 },

    #[error("field '{field}' is present but '{requires}' is not")]
    MissingPrerequisite { field: &'static str, requires: &'static str },
}

/// Partial update returned by a stage; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub schema: Option<SchemaDescription>,
    pub sql_query: Option<String>,
    pub query_explanation: Option<String>,
    pub confidence: Option<f64>,
    pub validation: Option<ValidationReport>,
    pub alternatives: Option<Vec<Alternative>>,
    pub execution_result: Option<ExecutionResult>,
    pub final_response: Option<FinalResponse>,
    pub error: Option<String>,
    pub retry_count: Option<u32>,
}

impl StateUpdate {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Names of the fields this update writes
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.schema.is_some() {
            fields.push("schema");
        }
        if self.sql_query.is_some() {
            fields.push("sqlQuery");
        }
        if self.query_explanation.is_some() {
            fields.push("queryExplanation");
        }
        if self.confidence.is_some() {
            fields.push("confidence");
        }
        if self.validation.is_some() {
            fields.push("validation");
        }
        if self.alternatives.is_some() {
            fields.push("alternatives");
        }
        if self.execution_result.is_some() {
            fields.push("executionResult");
        }
        if self.final_response.is_some() {
            fields.push("finalResponse");
        }
        if self.error.is_some() {
            fields.push("error");
        }
        if self.retry_count.is_some() {
            fields.push("retryCount");
        }
        fields
    }
}

/// Which stages may write each field
fn owners(field: &str) -> &'static [StageName] {
    match field {
        "schema" => &[StageName::SchemaLoad],
        "sqlQuery" | "queryExplanation" | "confidence" => {
            &[StageName::Translate, StageName::Experiment]
        }
        "validation" => &[StageName::Validate],
        "alternatives" => &[StageName::Experiment],
        "executionResult" => &[StageName::Execute],
        "finalResponse" => &[StageName::Interpret],
        "retryCount" => &[StageName::HandleError],
        "error" => &StageName::ALL,
        _ => &[],
    }
}

/// Classification of a terminal state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome<'a> {
    Answered(&'a FinalResponse),
    Failed(&'a str),
    /// Neither an answer nor an error; never produced by a finished run
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<Vec<Alternative>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response: Option<FinalResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,

    #[serde(skip)]
    query_replaced: bool,
}

impl PipelineState {
    pub fn new(question: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            question: question.into(),
            session_id,
            schema: None,
            sql_query: None,
            query_explanation: None,
            confidence: None,
            validation: None,
            alternatives: None,
            execution_result: None,
            final_response: None,
            error: None,
            retry_count: 0,
            query_replaced: false,
        }
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// A non-empty error is the authoritative failure signal
    pub fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// Record a failure outside of any stage's update (panics, wiring faults)
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !message.is_empty() {
            self.error = Some(message);
        }
    }

    pub fn outcome(&self) -> Outcome<'_> {
        match (&self.error, &self.final_response) {
            (Some(e), _) if !e.is_empty() => Outcome::Failed(e),
            (_, Some(response)) => Outcome::Answered(response),
            _ => Outcome::Incomplete,
        }
    }

    /// Merge a stage's update, rejecting writes the stage does not own
    ///
    /// The update is checked in full before any field is written, so a
    /// rejected update leaves the state untouched.
    pub fn apply(&mut self, stage: StageName, update: StateUpdate) -> Result<(), StateError> {
        for field in update.fields() {
            if !owners(field).contains(&stage) {
                return Err(StateError::FieldNotOwned { stage, field });
            }
        }

        if update.schema.is_some() && self.schema.is_some() {
            return Err(StateError::AlreadyWritten("schema"));
        }

        if let Some(candidate) = update.confidence {
            if !(0.0..=100.0).contains(&candidate) {
                return Err(StateError::InvalidConfidence(candidate));
            }
        }

        let rewrites_query = update.sql_query.is_some() || update.confidence.is_some();
        if rewrites_query {
            match stage {
                StageName::Experiment => {
                    if self.query_replaced {
                        return Err(StateError::AlreadyWritten("sqlQuery"));
                    }
                    let current = self.confidence.unwrap_or(0.0);
                    let candidate = update.confidence.unwrap_or(f64::NEG_INFINITY);
                    if candidate <= current {
                        return Err(StateError::ReplacementNotBetter { current, candidate });
                    }
                }
                _ => {
                    if self.sql_query.is_some() {
                        return Err(StateError::AlreadyWritten("sqlQuery"));
                    }
                }
            }
        }

        if update.final_response.is_some()
            && !self.execution_result.as_ref().is_some_and(|r| r.success)
        {
            return Err(StateError::InterpretWithoutSuccess);
        }

        if let Some(error) = &update.error {
            if error.is_empty() && self.has_error() {
                return Err(StateError::ErrorCleared);
            }
        }

        if let Some(proposed) = update.retry_count {
            if proposed != self.retry_count + 1 {
                return Err(StateError::RetryCountSkipped {
                    current: self.retry_count,
                    proposed,
                });
            }
        }

        if stage == StageName::Experiment && rewrites_query {
            self.query_replaced = true;
        }

        let StateUpdate {
            schema,
            sql_query,
            query_explanation,
            confidence,
            validation,
            alternatives,
            execution_result,
            final_response,
            error,
            retry_count,
        } = update;

        if schema.is_some() {
            self.schema = schema;
        }
        if sql_query.is_some() {
            self.sql_query = sql_query;
        }
        if query_explanation.is_some() {
            self.query_explanation = query_explanation;
        }
        if confidence.is_some() {
            self.confidence = confidence;
        }
        if validation.is_some() {
            self.validation = validation;
        }
        if alternatives.is_some() {
            self.alternatives = alternatives;
        }
        if execution_result.is_some() {
            self.execution_result = execution_result;
        }
        if final_response.is_some() {
            self.final_response = final_response;
        }
        if let Some(error) = error.filter(|e| !e.is_empty()) {
            self.error = Some(error);
        }
        if let Some(count) = retry_count {
            self.retry_count = count;
        }

        Ok(())
    }

    /// Check that every populated field has the fields it depends on
    pub fn check_invariants(&self) -> Result<(), StateError> {
        let require = |present: bool, field, ok: bool, requires| {
            if present && !ok {
                Err(StateError::MissingPrerequisite { field, requires })
            } else {
                Ok(())
            }
        };

        require(self.sql_query.is_some(), "sqlQuery", self.schema.is_some(), "schema")?;
        require(self.validation.is_some(), "validation", self.sql_query.is_some(), "sqlQuery")?;
        require(
            self.execution_result.is_some(),
            "executionResult",
            self.validation.is_some(),
            "validation",
        )?;

        if self.final_response.is_some()
            && !self.execution_result.as_ref().is_some_and(|r| r.success)
        {
            return Err(StateError::InterpretWithoutSuccess);
        }

        if let Some(confidence) = self.confidence {
            if !(0.0..=100.0).contains(&confidence) {
                return Err(StateError::InvalidConfidence(confidence));
            }
        }

        Ok(())
    }
}
