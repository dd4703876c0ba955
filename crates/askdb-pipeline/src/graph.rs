//! Typed pipeline graph
//!
//! A graph is an ordered list of stage handlers plus a routing table with one
//! outgoing edge per stage. It is assembled once through `GraphBuilder`,
//! checked, and never changed afterwards.

use askdb_state::{PipelineState, StageName};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::collaborators::Collaborators;
use crate::routing::{route_after_execute, route_after_translate, route_after_validate};
use crate::stages::{
    ExecuteStage, ExperimentStage, HandleErrorStage, InterpretStage, SchemaLoadStage, Stage,
    TranslateStage, ValidateStage,
};

/// Routing function: inspects the state and names the next stage
pub type RouteFn = fn(&PipelineState) -> StageName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Stage(StageName),
    End,
}

#[derive(Clone)]
pub enum Edge {
    Always(Next),
    Routed {
        route: RouteFn,
        targets: Vec<StageName>,
    },
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Always(next) => f.debug_tuple("Always").field(next).finish(),
            Edge::Routed { targets, .. } => {
                f.debug_struct("Routed").field("targets", targets).finish_non_exhaustive()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("stage {0} registered twice")]
    DuplicateStage(StageName),

    #[error("stage {0} is referenced but has no handler")]
    MissingStage(StageName),

    #[error("stage {0} has no outgoing edge")]
    MissingEdge(StageName),

    #[error("stage {0} has more than one outgoing edge")]
    DuplicateEdge(StageName),

    #[error("no edge leads to END")]
    NoTerminal,

    #[error("route from {from} chose undeclared target {to}")]
    UndeclaredRoute { from: StageName, to: StageName },
}

pub struct GraphBuilder {
    entry: StageName,
    error_stage: StageName,
    handlers: Vec<(StageName, Arc<dyn Stage>)>,
    edges: Vec<(StageName, Edge)>,
}

impl GraphBuilder {
    pub fn new(entry: StageName) -> Self {
        Self {
            entry,
            error_stage: StageName::HandleError,
            handlers: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Stage that failures are diverted to
    pub fn error_stage(mut self, stage: StageName) -> Self {
        self.error_stage = stage;
        self
    }

    pub fn stage(mut self, handler: Arc<dyn Stage>) -> Self {
        self.handlers.push((handler.name(), handler));
        self
    }

    pub fn edge(mut self, from: StageName, to: Next) -> Self {
        self.edges.push((from, Edge::Always(to)));
        self
    }

    pub fn route(mut self, from: StageName, targets: &[StageName], route: RouteFn) -> Self {
        self.edges.push((
            from,
            Edge::Routed {
                route,
                targets: targets.to_vec(),
            },
        ));
        self
    }

    pub fn build(self) -> Result<PipelineGraph, GraphError> {
        let mut handlers = HashMap::new();
        let mut order = Vec::new();
        for (name, handler) in self.handlers {
            if handlers.insert(name, handler).is_some() {
                return Err(GraphError::DuplicateStage(name));
            }
            order.push(name);
        }

        let mut edges = HashMap::new();
        for (from, edge) in self.edges {
            if !handlers.contains_key(&from) {
                return Err(GraphError::MissingStage(from));
            }
            let targets: Vec<StageName> = match &edge {
                Edge::Always(Next::Stage(to)) => vec![*to],
                Edge::Always(Next::End) => vec![],
                Edge::Routed { targets, .. } => targets.clone(),
            };
            if let Some(missing) = targets.into_iter().find(|t| !handlers.contains_key(t)) {
                return Err(GraphError::MissingStage(missing));
            }
            if edges.insert(from, edge).is_some() {
                return Err(GraphError::DuplicateEdge(from));
            }
        }

        for required in [self.entry, self.error_stage] {
            if !handlers.contains_key(&required) {
                return Err(GraphError::MissingStage(required));
            }
        }
        if let Some(stage) = order.iter().find(|s| !edges.contains_key(*s)) {
            return Err(GraphError::MissingEdge(*stage));
        }
        if !edges.values().any(|e| matches!(e, Edge::Always(Next::End))) {
            return Err(GraphError::NoTerminal);
        }

        Ok(PipelineGraph {
            entry: self.entry,
            error_stage: self.error_stage,
            handlers,
            edges,
        })
    }
}

pub struct PipelineGraph {
    entry: StageName,
    error_stage: StageName,
    handlers: HashMap<StageName, Arc<dyn Stage>>,
    edges: HashMap<StageName, Edge>,
}

impl PipelineGraph {
    /// The fixed question-answering graph
    pub fn standard(collaborators: &Collaborators) -> Result<Self, GraphError> {
        use StageName::*;

        GraphBuilder::new(SchemaLoad)
            .error_stage(HandleError)
            .stage(Arc::new(SchemaLoadStage::new(collaborators.schema.clone())))
            .stage(Arc::new(TranslateStage::new(collaborators.translator.clone())))
            .stage(Arc::new(ValidateStage::new(collaborators.validator.clone())))
            .stage(Arc::new(ExperimentStage::new(collaborators.alternatives.clone())))
            .stage(Arc::new(ExecuteStage::new(collaborators.executor.clone())))
            .stage(Arc::new(InterpretStage::new(collaborators.interpreter.clone())))
            .stage(Arc::new(HandleErrorStage))
            .edge(SchemaLoad, Next::Stage(Translate))
            .route(Translate, &[Validate, HandleError], route_after_translate)
            .route(Validate, &[Execute, Experiment, HandleError], route_after_validate)
            .edge(Experiment, Next::Stage(Execute))
            .route(Execute, &[Interpret, HandleError], route_after_execute)
            .edge(Interpret, Next::End)
            .edge(HandleError, Next::End)
            .build()
    }

    pub fn entry(&self) -> StageName {
        self.entry
    }

    pub fn error_stage(&self) -> StageName {
        self.error_stage
    }

    pub fn handler(&self, stage: StageName) -> Option<&Arc<dyn Stage>> {
        self.handlers.get(&stage)
    }

    /// Follow the outgoing edge of `stage` for the given state
    pub fn next(&self, stage: StageName, state: &PipelineState) -> Result<Next, GraphError> {
        match self.edges.get(&stage) {
            None => Err(GraphError::MissingEdge(stage)),
            Some(Edge::Always(next)) => Ok(*next),
            Some(Edge::Routed { route, targets }) => {
                let to = route(state);
                if targets.contains(&to) {
                    Ok(Next::Stage(to))
                } else {
                    Err(GraphError::UndeclaredRoute { from: stage, to })
                }
            }
        }
    }
}
