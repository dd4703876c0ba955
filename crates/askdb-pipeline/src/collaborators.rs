//! Interfaces the pipeline consumes
//!
//! Each stage calls exactly one of these. Implementations report business
//! failures through `CollaboratorError`; the stage turns them into state.

use askdb_state::{
    Alternative, ExecutionResult, FinalResponse, RiskTier, SchemaDescription, Translation,
    ValidationReport,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{0}")]
    Rejected(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl CollaboratorError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        CollaboratorError::Rejected(reason.into())
    }
}

#[async_trait]
pub trait SchemaService: Send + Sync {
    async fn load_schema(&self) -> Result<SchemaDescription, CollaboratorError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        question: &str,
        schema: &SchemaDescription,
    ) -> Result<Translation, CollaboratorError>;
}

#[async_trait]
pub trait QueryValidator: Send + Sync {
    async fn validate(
        &self,
        sql: &str,
        question: &str,
        schema: &SchemaDescription,
        explanation: &str,
    ) -> Result<ValidationReport, CollaboratorError>;
}

#[async_trait]
pub trait AlternativeGenerator: Send + Sync {
    async fn generate_alternatives(
        &self,
        sql: &str,
        question: &str,
        schema: &SchemaDescription,
    ) -> Result<Vec<Alternative>, CollaboratorError>;
}

/// Runs a query; refusals and timeouts come back as `success == false`
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        sql: &str,
        validated: bool,
        risk_tier: RiskTier,
    ) -> Result<ExecutionResult, CollaboratorError>;
}

#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn interpret(
        &self,
        question: &str,
        sql: &str,
        result: &ExecutionResult,
    ) -> Result<FinalResponse, CollaboratorError>;
}

/// One implementation of every collaborator, shared by all runs
#[derive(Clone)]
pub struct Collaborators {
    pub schema: Arc<dyn SchemaService>,
    pub translator: Arc<dyn Translator>,
    pub validator: Arc<dyn QueryValidator>,
    pub alternatives: Arc<dyn AlternativeGenerator>,
    pub executor: Arc<dyn QueryExecutor>,
    pub interpreter: Arc<dyn Interpreter>,
}
