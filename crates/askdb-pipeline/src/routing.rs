//! Routing decisions between stages

use askdb_state::{PipelineState, StageName};

/// Queries translated below this confidence are sent to Experiment first
pub const CONFIDENCE_THRESHOLD: f64 = 70.0;

pub fn route_after_translate(state: &PipelineState) -> StageName {
    if state.has_error() {
        StageName::HandleError
    } else {
        StageName::Validate
    }
}

pub fn route_after_validate(state: &PipelineState) -> StageName {
    let Some(validation) = &state.validation else {
        return StageName::HandleError;
    };
    if state.has_error() {
        return StageName::HandleError;
    }

    let low_confidence = state
        .confidence
        .is_some_and(|c| c < CONFIDENCE_THRESHOLD);

    if !validation.valid || !validation.should_execute || low_confidence {
        StageName::Experiment
    } else {
        StageName::Execute
    }
}

pub fn route_after_execute(state: &PipelineState) -> StageName {
    match &state.execution_result {
        Some(result) if result.success && !state.has_error() => StageName::Interpret,
        _ => StageName::HandleError,
    }
}
