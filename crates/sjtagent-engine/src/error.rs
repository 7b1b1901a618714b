use std::fmt;

use serde::Serialize;
use thiserror::Error;

use sjtagent_core::error::ModelErrorKind;
use sjtagent_core::types::TokenUsage;
use sjtagent_llm::CallError;

use crate::batch::{Aggregate, Cursor};
use crate::graph::{State, StepRecord};

/// A graph rejected at build time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph has no entry step")]
    MissingEntry,

    #[error("entry step '{0}' is not defined")]
    UnknownEntry(String),

    #[error("step '{0}' is defined twice")]
    DuplicateStep(String),

    #[error("edge references undefined step '{0}'")]
    UnknownStep(String),

    #[error("step '{0}' has more than one outgoing edge")]
    DuplicateEdge(String),

    #[error("step '{0}' has no outgoing edge")]
    MissingEdge(String),

    #[error("conditional edge from '{0}' declares no labels")]
    EmptyRoutes(String),

    #[error("conditional edge from '{step}' cannot route label '{label}'")]
    UnroutedLabel { step: String, label: String },

    #[error("step '{0}' feeds a conditional edge but declares no labels and has no router")]
    NoLabelSource(String),

    #[error("step '{0}' can never reach a terminal marker")]
    NoEscape(String),
}

/// Failure reported by a single step. The engine never retries these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct StepFailure {
    pub reason: String,
    /// Model call attempts made before giving up, when the step called a model.
    pub attempts: u32,
    pub model_error: Option<ModelErrorKind>,
    /// Tokens spent by the step's model calls, failed attempts included.
    pub usage: TokenUsage,
}

impl StepFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            attempts: 0,
            model_error: None,
            usage: TokenUsage::default(),
        }
    }

    /// A model call that exhausted its retries.
    pub fn exhausted(step: &str, err: CallError) -> Self {
        Self {
            reason: format!("{}: {}", step, err),
            attempts: err.attempts,
            model_error: Some(err.last.kind),
            usage: err.usage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A step failed or wrote outside its declared fields.
    StepError,
    /// A conditional edge received a label it does not route.
    RoutingError,
    /// A step was entered more often than its bound allows.
    IterationLimitExceeded,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::StepError => "step error",
            FailureKind::RoutingError => "routing error",
            FailureKind::IterationLimitExceeded => "iteration limit exceeded",
        };
        f.write_str(s)
    }
}

/// A run that stopped without reaching a terminal marker.
///
/// Carries the last consistent state and the trace so the caller can report
/// or resume from the failing step.
#[derive(Debug, Clone, Error)]
#[error("{kind} at step '{step}' (entry {entry}): {message}")]
pub struct RunFailure {
    pub kind: FailureKind,
    pub step: String,
    /// How many times `step` had been entered when the run failed.
    pub entry: u32,
    pub message: String,
    pub last_state: State,
    pub trace: Vec<StepRecord>,
    pub cause: Option<StepFailure>,
}

/// One batch could not be evaluated.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
    /// Absolute index of the work item that failed, when known.
    pub item: Option<usize>,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            item: None,
        }
    }

    pub fn at_item(item: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            item: Some(item),
        }
    }
}

/// Fail-fast abort of a batch run, with everything folded before the failure.
#[derive(Debug, Clone)]
pub struct BatchFailure<A> {
    pub error: EvalError,
    /// Zero-based position of the failed batch.
    pub batch: usize,
    pub cursor: Cursor,
    pub aggregate: Aggregate<A>,
}

impl<A> fmt::Display for BatchFailure<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {} [{}, {}) failed: {}",
            self.batch, self.cursor.start, self.cursor.end, self.error
        )
    }
}

impl<A: fmt::Debug> std::error::Error for BatchFailure<A> {}
