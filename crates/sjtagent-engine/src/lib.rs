//! Workflow execution for sjtagent.
//!
//! [`graph`] holds the step/edge data model and the [`Engine`] that drives
//! it; [`batch`] holds the coordinator used by evaluation runs.

pub mod batch;
pub mod error;
pub mod graph;
pub mod model_step;

pub use batch::{
    Aggregate, Aggregator, Batch, BatchCoordinator, BatchEvaluator, BatchStatus, Concurrent,
    Cursor, ItemEvaluator, SkippedBatch,
};
pub use error::{BatchFailure, EvalError, FailureKind, GraphError, RunFailure, StepFailure};
pub use graph::{
    ConditionalEdge, Edge, Engine, FnStep, Graph, GraphBuilder, PredicateRouter, Router,
    RunOutcome, RunStatus, State, StateUpdate, Step, StepRecord, Target, END,
};
pub use model_step::{ModelStep, StepPrompt, USAGE_FIELD};
pub use sjtagent_core::config::BatchErrorPolicy;
pub use tokio_util::sync::CancellationToken;
