//! SJT item generation and pairwise evaluation.
//!
//! [`generation`] wires the item-writing steps into a revision loop on the
//! engine; [`evaluation`] judges items from competing methods pair by pair
//! through the batch coordinator.

pub mod cost;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod generation;
pub mod prompts;
pub mod quality;

pub use cost::{count_tokens, CostEstimate};
pub use dataset::FileDataSource;
pub use error::{PipelineError, Result};
pub use evaluation::{
    ComparisonPair, ComparisonRow, EvaluationAggregate, EvaluationFailure, EvaluationReport,
    Evaluator, PairwiseJudgment, SjtItem, TraitEvaluation, WinRates, Winner,
};
pub use generation::{GeneratedItem, GenerationRequest, Generator, PartialGeneration};
pub use quality::{BehaviorOption, QualityReport};
