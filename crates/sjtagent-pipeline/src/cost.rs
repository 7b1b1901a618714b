use std::sync::OnceLock;

use serde::Serialize;
use tiktoken_rs::CoreBPE;

use sjtagent_core::config::CostConfig;
use sjtagent_core::types::{ModelRequest, TokenUsage};

/// Output tokens budgeted per judged dimension, plus JSON overhead per call.
const OUTPUT_TOKENS_PER_DIMENSION: u64 = 10;
const OUTPUT_TOKENS_OVERHEAD: u64 = 20;

fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "cl100k_base tokenizer unavailable, estimating by length");
                None
            }
        })
        .as_ref()
}

/// Token count of `text` under cl100k_base.
pub fn count_tokens(text: &str) -> usize {
    match tokenizer() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Projected spend of an evaluation run, before any call is made.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostEstimate {
    pub calls: usize,
    pub usage: TokenUsage,
    pub cost: f64,
}

/// Estimate `calls` judge calls shaped like `sample`, each answering
/// `dimensions` verdicts.
pub fn estimate(sample: &ModelRequest, calls: usize, dimensions: usize, rates: &CostConfig) -> CostEstimate {
    let input_per_call = count_tokens(&sample.rendered()) as u64;
    let output_per_call = dimensions as u64 * OUTPUT_TOKENS_PER_DIMENSION + OUTPUT_TOKENS_OVERHEAD;
    let usage = TokenUsage::new(input_per_call * calls as u64, output_per_call * calls as u64);
    CostEstimate {
        calls,
        usage,
        cost: rates.calculate_cost(&usage),
    }
}
