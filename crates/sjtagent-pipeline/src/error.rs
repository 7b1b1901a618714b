use thiserror::Error;

use sjtagent_core::error::SjtError;
use sjtagent_engine::{BatchFailure, GraphError, RunFailure};

use crate::evaluation::EvaluationAggregate;
use crate::generation::PartialGeneration;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid workflow: {0}")]
    Graph(#[from] GraphError),

    #[error("generation run failed: {0}")]
    Run(Box<RunFailure>),

    #[error("evaluation of '{trait_name}' aborted: {failure}")]
    Batch {
        trait_name: String,
        failure: Box<BatchFailure<EvaluationAggregate>>,
    },

    #[error("run cancelled before completion")]
    Cancelled(Box<PartialGeneration>),

    #[error("incomplete state: {0}")]
    Incomplete(String),

    #[error(transparent)]
    Data(#[from] SjtError),
}

impl From<RunFailure> for PipelineError {
    fn from(failure: RunFailure) -> Self {
        PipelineError::Run(Box::new(failure))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
