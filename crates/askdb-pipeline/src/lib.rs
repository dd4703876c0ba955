//! askdb query-processing pipeline
//!
//! Turns a natural-language question into an executed SQL query and an
//! answer by running a fixed graph of stages over a shared
//! [`PipelineState`](askdb_state::PipelineState):
//!
//! ```text
//! SchemaLoad -> Translate -> Validate -> [Experiment] -> Execute -> Interpret
//!                   \______________\____________________\____> HandleError
//! ```
//!
//! Stages call out to collaborators (schema service, translator, validator,
//! executor, interpreter) through the traits in [`collaborators`]; progress
//! is reported out-of-band to a [`ProgressSink`].

pub mod collaborators;
pub mod graph;
pub mod orchestrator;
pub mod progress;
pub mod routing;
pub mod stages;

pub use collaborators::{
    AlternativeGenerator, CollaboratorError, Collaborators, Interpreter, QueryExecutor,
    QueryValidator, SchemaService, Translator,
};
pub use graph::{Edge, GraphBuilder, GraphError, Next, PipelineGraph};
pub use orchestrator::Orchestrator;
pub use progress::{
    BroadcastSink, FanoutSink, Phase, ProgressDelivery, ProgressEvent, ProgressHandle,
    ProgressSink, SessionEvent, SinkError, TracingSink,
};
pub use routing::CONFIDENCE_THRESHOLD;
pub use stages::Stage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::collaborators::*;
    pub use crate::orchestrator::Orchestrator;
    pub use crate::progress::{ProgressEvent, ProgressSink};
    pub use askdb_state::{Outcome, PipelineState, StageName};
}
