//! Pipeline engine
//!
//! Drives one `PipelineState` through the graph, one stage at a time, until
//! a stage's edge reaches END. Failures of any kind are folded into the
//! state and diverted to the error stage; `run` always returns a state.

use askdb_state::{PipelineState, StageName, StateUpdate};
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::collaborators::Collaborators;
use crate::graph::{GraphError, Next, PipelineGraph};
use crate::progress::{Phase, ProgressDelivery, ProgressEvent, ProgressHandle, ProgressSink};

/// Upper bound on stage invocations per run
pub const DEFAULT_MAX_STEPS: usize = 32;

pub struct Orchestrator {
    graph: PipelineGraph,
    sink: Option<Arc<dyn ProgressSink>>,
    max_steps: usize,
}

impl Orchestrator {
    /// Orchestrator over the standard graph
    pub fn new(collaborators: Collaborators) -> Result<Self, GraphError> {
        Ok(Self::from_graph(PipelineGraph::standard(&collaborators)?))
    }

    pub fn from_graph(graph: PipelineGraph) -> Self {
        Self {
            graph,
            sink: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Answer one question; never panics and never returns an error
    pub async fn run(&self, question: &str, session_id: Option<&str>) -> PipelineState {
        let (state, _delivery) = self.run_tracked(question, session_id).await;
        state
    }

    /// Like `run`, also returning the run's progress delivery
    ///
    /// Awaiting `ProgressDelivery::flushed` guarantees every event of the run
    /// has reached the sink; the run itself never waits for it.
    pub async fn run_tracked(
        &self,
        question: &str,
        session_id: Option<&str>,
    ) -> (PipelineState, ProgressDelivery) {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "pipeline_run",
            run_id = %run_id,
            session_id = session_id.unwrap_or("-")
        );

        self.drive(PipelineState::new(question, session_id.map(str::to_string)))
            .instrument(span)
            .await
    }

    async fn drive(&self, mut state: PipelineState) -> (PipelineState, ProgressDelivery) {
        // The forwarder finishes once `progress` is dropped at the end of the run
        let (progress, delivery) = match (&self.sink, state.session_id()) {
            (Some(sink), Some(session_id)) => ProgressHandle::spawn(sink.clone(), session_id.to_string()),
            _ => (ProgressHandle::disabled(), ProgressDelivery::none()),
        };

        let error_stage = self.graph.error_stage();
        let mut current = self.graph.entry();
        let mut steps = 0usize;
        let mut limit_reached = false;

        tracing::info!(question = %state.question(), "Pipeline run started");

        loop {
            steps += 1;
            if steps > self.max_steps && current != error_stage {
                if limit_reached {
                    break;
                }
                limit_reached = true;
                let message = format!("pipeline exceeded {} stage invocations", self.max_steps);
                tracing::error!(stage = %current, "{}", message);
                state.record_error(message);
                current = error_stage;
                continue;
            }

            let result = self.step(current, &mut state, &progress).await;

            let next = match result {
                Ok(()) => self.graph.next(current, &state),
                Err(message) => {
                    state.record_error(message);
                    Ok(Next::Stage(error_stage))
                }
            };

            match next {
                Ok(Next::Stage(stage)) if current == error_stage && stage == error_stage => break,
                Ok(Next::Stage(stage)) => current = stage,
                Ok(Next::End) => break,
                Err(e) => {
                    tracing::error!(stage = %current, error = %e, "Routing failed");
                    state.record_error(format!("routing after {} failed: {}", current, e));
                    if current == error_stage {
                        break;
                    }
                    current = error_stage;
                }
            }
        }

        if state.final_response.is_none() && !state.has_error() {
            state.record_error("pipeline ended without a result");
        }

        if let Err(e) = state.check_invariants() {
            tracing::error!(error = %e, "Terminal state violates pipeline invariants");
        }

        match &state.error {
            Some(error) => tracing::warn!(retry_count = state.retry_count, error = %error, "Pipeline run failed"),
            None => tracing::info!("Pipeline run answered"),
        }

        (state, delivery)
    }

    /// Run one stage and merge its update; `Err` carries a failure message
    async fn step(
        &self,
        stage: StageName,
        state: &mut PipelineState,
        progress: &ProgressHandle,
    ) -> Result<(), String> {
        let Some(handler) = self.graph.handler(stage) else {
            return Err(format!("no handler registered for {}", stage));
        };

        let span = tracing::debug_span!("stage", stage = %stage);

        progress.emit(ProgressEvent::new(stage, Phase::Starting, starting_message(stage)));
        let started = Instant::now();

        let outcome = AssertUnwindSafe(handler.run(state, progress))
            .catch_unwind()
            .instrument(span)
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;

        let update: StateUpdate = match outcome {
            Ok(update) => update,
            Err(panic) => {
                let message = format!("{} failed unexpectedly: {}", stage, panic_message(&*panic));
                tracing::error!(stage = %stage, elapsed_ms, "{}", message);
                progress.emit(
                    ProgressEvent::new(stage, Phase::Error, message.clone())
                        .with_payload(json!({ "elapsedMs": elapsed_ms })),
                );
                return Err(message);
            }
        };

        let stage_error = update.error.clone();
        if let Err(e) = state.apply(stage, update) {
            let message = format!("{} produced an invalid update: {}", stage, e);
            tracing::error!(stage = %stage, "{}", message);
            progress.emit(ProgressEvent::new(stage, Phase::Error, message.clone()));
            return Err(message);
        }

        tracing::debug!(stage = %stage, elapsed_ms, failed = stage_error.is_some(), "Stage finished");

        let mut payload = stage_summary(stage, state);
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("elapsedMs".to_string(), json!(elapsed_ms));
        }

        let event = match stage_error {
            Some(error) => ProgressEvent::new(stage, Phase::Error, error),
            None => ProgressEvent::new(stage, Phase::Completed, completed_message(stage, state)),
        };
        progress.emit(event.with_payload(payload));

        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn starting_message(stage: StageName) -> &'static str {
    match stage {
        StageName::SchemaLoad => "Loading database schema",
        StageName::Translate => "Translating question to SQL",
        StageName::Validate => "Validating generated SQL",
        StageName::Experiment => "Looking for a better query",
        StageName::Execute => "Executing query",
        StageName::Interpret => "Interpreting results",
        StageName::HandleError => "Handling pipeline failure",
    }
}

fn completed_message(stage: StageName, state: &PipelineState) -> String {
    match stage {
        StageName::SchemaLoad => format!(
            "Schema loaded ({} tables)",
            state.schema.as_ref().map_or(0, |s| s.tables.len())
        ),
        StageName::Translate => "SQL generated".to_string(),
        StageName::Validate => match &state.validation {
            Some(v) if v.valid => format!("Query validated (risk {})", v.risk_tier),
            _ => "Query failed validation".to_string(),
        },
        StageName::Experiment => "Alternatives evaluated".to_string(),
        StageName::Execute => format!(
            "Query returned {} rows",
            state.execution_result.as_ref().map_or(0, |r| r.row_count)
        ),
        StageName::Interpret => "Answer ready".to_string(),
        StageName::HandleError => "Failure recorded".to_string(),
    }
}

/// Structured payload describing what a stage wrote
fn stage_summary(stage: StageName, state: &PipelineState) -> serde_json::Value {
    match stage {
        StageName::SchemaLoad => json!({
            "tables": state.schema.as_ref().map_or(0, |s| s.tables.len()),
        }),
        StageName::Translate | StageName::Experiment => json!({
            "sqlQuery": state.sql_query,
            "confidence": state.confidence,
            "alternatives": state.alternatives.as_ref().map(Vec::len),
        }),
        StageName::Validate => match &state.validation {
            Some(v) => json!({
                "valid": v.valid,
                "riskTier": v.risk_tier,
                "shouldExecute": v.should_execute,
            }),
            None => json!({}),
        },
        StageName::Execute => match &state.execution_result {
            Some(r) => json!({
                "success": r.success,
                "rowCount": r.row_count,
                "executionTimeMs": r.execution_time_ms,
                "truncated": r.truncated,
            }),
            None => json!({}),
        },
        StageName::Interpret => json!({
            "summary": state.final_response.as_ref().map(|r| r.summary.as_str()),
        }),
        StageName::HandleError => json!({
            "retryCount": state.retry_count,
            "error": state.error,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extracts_text() {
        let boxed: Box<dyn Any + Send> = Box::new("driver crashed");
        assert_eq!(panic_message(&*boxed), "driver crashed");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }

    #[test]
    fn test_every_stage_has_messages() {
        let state = PipelineState::new("q", None);
        for stage in StageName::ALL {
            assert!(!starting_message(stage).is_empty());
            assert!(!completed_message(stage, &state).is_empty());
            assert!(stage_summary(stage, &state).is_object());
        }
    }
}
