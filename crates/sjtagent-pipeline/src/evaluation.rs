//! Pairwise evaluation of SJT items produced by different methods.
//!
//! Every pair of items from different methods is judged once by the model
//! on all dimensions. Pairs run through the batch coordinator: concurrent
//! within a batch, folded in cursor order across batches.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sjtagent_core::config::{AppConfig, CostConfig, Dimension, ModelConfig};
use sjtagent_core::error::ModelError;
use sjtagent_core::traits::ModelClient;
use sjtagent_core::types::{ChatMessage, ModelRequest, TokenUsage};
use sjtagent_engine::{
    Aggregate, BatchCoordinator, BatchFailure, Concurrent, Cursor, EvalError, ItemEvaluator,
};
use sjtagent_llm::{call_structured, parse_json_object, CallPolicy};

use crate::cost::{self, CostEstimate};
use crate::error::{PipelineError, Result};
use crate::prompts;

/// An item as stored in evaluation datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SjtItem {
    #[serde(alias = "scenario_text")]
    pub situation: String,
    #[serde(default)]
    pub options: Value,
}

/// Method prefix of an item id of the form `<method>_<index>`.
pub fn method_of(id: &str) -> &str {
    id.split('_').next().unwrap_or(id)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComparisonPair {
    pub a: String,
    pub b: String,
}

/// Every unordered pair of items from different methods, in lexicographic
/// id order.
pub fn generate_pairs<S: AsRef<str>>(ids: &[S]) -> Vec<ComparisonPair> {
    let sorted: BTreeSet<&str> = ids.iter().map(|id| id.as_ref()).collect();
    let sorted: Vec<&str> = sorted.into_iter().collect();
    let mut pairs = Vec::new();
    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            if method_of(a) != method_of(b) {
                pairs.push(ComparisonPair {
                    a: a.to_string(),
                    b: b.to_string(),
                });
            }
        }
    }
    pairs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    A,
    B,
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Winner::A => f.write_str("A"),
            Winner::B => f.write_str("B"),
        }
    }
}

/// The standard SJT comparison dimensions. `{trait}` is replaced with the
/// trait under evaluation.
pub fn default_dimensions() -> Vec<Dimension> {
    vec![
        Dimension::new(
            "NecessityOfTheSituation",
            "Which item's situation is more indispensable and reflects {trait} more accurately",
        ),
        Dimension::new(
            "RationalityOfOptions",
            "Which item's options are more realistic, more relevant to the situation and more plausible",
        ),
        Dimension::new(
            "RationalityOfScoring",
            "With options A and B keyed high and options C and D keyed low on {trait}, which item's scoring is more accurate and reasonable",
        ),
        Dimension::new(
            "OverallItemQuality",
            "Which item is better overall in grammar, situational richness for measuring {trait}, psychological realism and scoring",
        ),
    ]
}

/// Resolve the dimensions for `trait_name`, falling back to the defaults.
pub fn dimensions_for(trait_name: &str, configured: &[Dimension]) -> Vec<Dimension> {
    let base = if configured.is_empty() {
        default_dimensions()
    } else {
        configured.to_vec()
    };
    base.into_iter()
        .map(|d| Dimension::new(d.name, d.description.replace("{trait}", trait_name)))
        .collect()
}

/// Read `{dimension: "A"|"B"}` from a judge answer, in dimension order.
///
/// Dimensions with a missing or invalid verdict are dropped; an answer with
/// no usable verdict at all is malformed.
pub fn parse_verdicts(
    answer: &Value,
    dimensions: &[Dimension],
) -> std::result::Result<Vec<(String, Winner)>, ModelError> {
    let mut verdicts = Vec::with_capacity(dimensions.len());
    for dim in dimensions {
        let raw = answer.get(&dim.name).and_then(Value::as_str).map(str::trim);
        match raw.map(str::to_ascii_uppercase).as_deref() {
            Some("A") => verdicts.push((dim.name.clone(), Winner::A)),
            Some("B") => verdicts.push((dim.name.clone(), Winner::B)),
            _ => warn!(dimension = %dim.name, value = ?answer.get(&dim.name), "Dropping invalid verdict"),
        }
    }
    if verdicts.is_empty() {
        return Err(ModelError::malformed(format!(
            "expected \"A\" or \"B\" for at least one of: {}",
            dimensions.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
        )));
    }
    Ok(verdicts)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseJudgment {
    pub item_a: String,
    pub item_b: String,
    pub dimension: String,
    pub winner: Winner,
    pub evaluated_at: DateTime<Utc>,
}

/// Result of judging one pair.
#[derive(Debug, Clone)]
pub struct PairOutcome {
    pub judgments: Vec<PairwiseJudgment>,
    pub usage: TokenUsage,
}

/// Judges pairs of items with one model call per pair.
pub struct PairJudge {
    client: Arc<dyn ModelClient>,
    model: ModelConfig,
    policy: CallPolicy,
    items: Arc<BTreeMap<String, SjtItem>>,
    dimensions: Vec<Dimension>,
}

impl PairJudge {
    pub fn new(
        client: Arc<dyn ModelClient>,
        model: ModelConfig,
        policy: CallPolicy,
        items: Arc<BTreeMap<String, SjtItem>>,
        dimensions: Vec<Dimension>,
    ) -> Self {
        Self {
            client,
            model,
            policy,
            items,
            dimensions,
        }
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// The judge request for `pair`.
    pub fn request_for(&self, pair: &ComparisonPair) -> std::result::Result<ModelRequest, EvalError> {
        let lookup = |id: &str| {
            self.items
                .get(id)
                .ok_or_else(|| EvalError::new(format!("unknown item '{}'", id)))
        };
        let a = lookup(&pair.a)?;
        let b = lookup(&pair.b)?;

        let listed: Vec<String> = self
            .dimensions
            .iter()
            .enumerate()
            .map(|(i, d)| format!("{}. {}: {}", i + 1, d.name, d.description))
            .collect();
        let example: serde_json::Map<String, Value> = self
            .dimensions
            .iter()
            .map(|d| (d.name.clone(), json!("A")))
            .collect();
        let pretty = |v: &Value| serde_json::to_string_pretty(v).unwrap_or_default();

        let user = format!(
            "Compare the quality of the following two situational judgement test items on several dimensions.\n\n\
             Dimensions:\n{}\n\n\
             Item A:\nSituation: {}\nOptions: {}\n\n\
             Item B:\nSituation: {}\nOptions: {}\n\n\
             For each dimension choose the better item, \"A\" or \"B\".\n\
             Example output:\n{}\n\
             Only \"A\" or \"B\" are allowed.",
            listed.join("\n"),
            a.situation,
            pretty(&a.options),
            b.situation,
            pretty(&b.options),
            pretty(&Value::Object(example)),
        );
        Ok(ModelRequest::new(vec![
            ChatMessage::system(prompts::JUDGE_SYSTEM),
            ChatMessage::user(user),
        ]))
    }
}

impl ItemEvaluator<ComparisonPair> for PairJudge {
    type Output = PairOutcome;

    fn evaluate_item<'a>(
        &'a self,
        index: usize,
        pair: &'a ComparisonPair,
    ) -> BoxFuture<'a, std::result::Result<PairOutcome, EvalError>> {
        Box::pin(async move {
            let request = self.request_for(pair).map_err(|e| EvalError {
                item: Some(index),
                ..e
            })?;
            let outcome = call_structured(
                self.client.as_ref(),
                &self.model,
                request,
                &self.policy,
                |text| parse_verdicts(&parse_json_object(text)?, &self.dimensions),
            )
            .await
            .map_err(|e| EvalError::at_item(index, format!("{} vs {}: {}", pair.a, pair.b, e)))?;

            if outcome.value.len() < self.dimensions.len() {
                warn!(
                    a = %pair.a,
                    b = %pair.b,
                    missing = self.dimensions.len() - outcome.value.len(),
                    "Some dimensions were not judged"
                );
            }
            let evaluated_at = Utc::now();
            let judgments = outcome
                .value
                .into_iter()
                .map(|(dimension, winner)| PairwiseJudgment {
                    item_a: pair.a.clone(),
                    item_b: pair.b.clone(),
                    dimension,
                    winner,
                    evaluated_at,
                })
                .collect();
            Ok(PairOutcome {
                judgments,
                usage: outcome.usage,
            })
        })
    }
}

/// Everything folded from judged batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationAggregate {
    pub judgments: Vec<PairwiseJudgment>,
    pub pairs_judged: usize,
    pub usage: TokenUsage,
}

impl EvaluationAggregate {
    pub fn fold(&mut self, batch: Vec<PairOutcome>) {
        for outcome in batch {
            self.pairs_judged += 1;
            self.usage.add(outcome.usage);
            self.judgments.extend(outcome.judgments);
        }
    }
}

/// `dimension -> method -> win rate`.
pub type WinRates = BTreeMap<String, BTreeMap<String, f64>>;

/// Per dimension, the share of that dimension's judgments each method won.
pub fn win_rates<S: AsRef<str>>(judgments: &[PairwiseJudgment], methods: &[S]) -> WinRates {
    let mut totals: BTreeMap<&str, usize> = BTreeMap::new();
    let mut wins: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    for j in judgments {
        *totals.entry(j.dimension.as_str()).or_insert(0) += 1;
        let winner_id = match j.winner {
            Winner::A => &j.item_a,
            Winner::B => &j.item_b,
        };
        *wins
            .entry((j.dimension.as_str(), method_of(winner_id)))
            .or_insert(0) += 1;
    }

    totals
        .into_iter()
        .map(|(dim, total)| {
            let per_method = methods
                .iter()
                .map(|m| {
                    let m = m.as_ref();
                    let won = wins.get(&(dim, m)).copied().unwrap_or(0);
                    (m.to_string(), won as f64 / total as f64)
                })
                .collect();
            (dim.to_string(), per_method)
        })
        .collect()
}

/// Average each method's win rate over the traits that report it.
pub fn overall_win_rates(by_trait: &BTreeMap<String, WinRates>) -> WinRates {
    let mut sums: BTreeMap<String, BTreeMap<String, (f64, usize)>> = BTreeMap::new();
    for rates in by_trait.values() {
        for (dim, per_method) in rates {
            for (method, rate) in per_method {
                let slot = sums
                    .entry(dim.clone())
                    .or_default()
                    .entry(method.clone())
                    .or_insert((0.0, 0));
                slot.0 += rate;
                slot.1 += 1;
            }
        }
    }
    sums.into_iter()
        .map(|(dim, per_method)| {
            let averaged = per_method
                .into_iter()
                .map(|(method, (sum, n))| (method, sum / n as f64))
                .collect();
            (dim, averaged)
        })
        .collect()
}

/// One exported comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    #[serde(rename = "A")]
    pub a: String,
    #[serde(rename = "B")]
    pub b: String,
    pub dimension: String,
    pub winner: Winner,
    pub evaluated_at: String,
}

/// Tabular projection of the judgments, in fold order.
pub fn rows(aggregate: &EvaluationAggregate) -> Vec<ComparisonRow> {
    aggregate
        .judgments
        .iter()
        .map(|j| ComparisonRow {
            a: j.item_a.clone(),
            b: j.item_b.clone(),
            dimension: j.dimension.clone(),
            winner: j.winner,
            evaluated_at: j.evaluated_at.to_rfc3339(),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct TraitEvaluation {
    pub trait_name: String,
    pub pairs: usize,
    pub aggregate: Aggregate<EvaluationAggregate>,
    pub win_rates: WinRates,
    pub rows: Vec<ComparisonRow>,
}

impl TraitEvaluation {
    fn new<S: AsRef<str>>(
        trait_name: &str,
        pairs: usize,
        aggregate: Aggregate<EvaluationAggregate>,
        methods: &[S],
    ) -> Self {
        Self {
            trait_name: trait_name.to_string(),
            pairs,
            win_rates: win_rates(&aggregate.value.judgments, methods),
            rows: rows(&aggregate.value),
            aggregate,
        }
    }
}

/// The batch that aborted a fail-fast evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationFailure {
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub batch: usize,
    pub cursor: Cursor,
    pub error: EvalError,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub methods: Vec<String>,
    pub traits: BTreeMap<String, TraitEvaluation>,
    pub overall_win_rates: WinRates,
    pub usage: TokenUsage,
    pub cost: f64,
    /// False when cancelled, aborted, or when any batch was skipped.
    pub complete: bool,
    /// Set when a batch failure stopped the run under fail-fast. The failed
    /// trait's partial results are still in `traits`.
    pub failure: Option<EvaluationFailure>,
}

/// Drives pairwise evaluation for one or more traits.
pub struct Evaluator {
    client: Arc<dyn ModelClient>,
    model: ModelConfig,
    policy: CallPolicy,
    coordinator: BatchCoordinator,
    max_concurrent: usize,
    dimensions: Vec<Dimension>,
    rates: CostConfig,
}

impl Evaluator {
    pub fn new(client: Arc<dyn ModelClient>, config: &AppConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            policy: CallPolicy::from_engine(&config.engine),
            coordinator: BatchCoordinator::from_config(
                &config.engine.run_config(),
                config.evaluation.batch_size,
            ),
            max_concurrent: config.evaluation.max_concurrent,
            dimensions: config.evaluation.dimensions.clone(),
            rates: config.evaluation.cost,
        }
    }

    pub fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn judge(&self, trait_name: &str, items: BTreeMap<String, SjtItem>) -> PairJudge {
        PairJudge::new(
            self.client.clone(),
            self.model.clone(),
            self.policy.clone(),
            Arc::new(items),
            dimensions_for(trait_name, &self.dimensions),
        )
    }

    /// Projected token use and spend for judging `items`.
    pub fn estimate(&self, trait_name: &str, items: &BTreeMap<String, SjtItem>) -> CostEstimate {
        let judge = self.judge(trait_name, items.clone());
        let ids: Vec<&String> = items.keys().collect();
        let pairs = generate_pairs(&ids);
        let sample = pairs
            .first()
            .and_then(|p| judge.request_for(p).ok())
            .unwrap_or_default();
        cost::estimate(&sample, pairs.len(), judge.dimensions().len(), &self.rates)
    }

    pub async fn evaluate_trait(
        &self,
        trait_name: &str,
        items: BTreeMap<String, SjtItem>,
        cancel: &CancellationToken,
    ) -> Result<TraitEvaluation> {
        let ids: Vec<&String> = items.keys().collect();
        let pairs = generate_pairs(&ids);
        info!(
            trait_name,
            items = items.len(),
            pairs = pairs.len(),
            batch_size = self.coordinator.batch_size(),
            "Evaluating trait"
        );

        let judge = Concurrent::new(self.judge(trait_name, items), self.max_concurrent);
        let aggregate = self
            .coordinator
            .run_batches(
                &pairs,
                &judge,
                &EvaluationAggregate::fold,
                EvaluationAggregate::default(),
                cancel,
            )
            .await
            .map_err(|failure| PipelineError::Batch {
                trait_name: trait_name.to_string(),
                failure: Box::new(failure),
            })?;

        let methods: BTreeSet<&str> = pairs
            .iter()
            .flat_map(|p| [method_of(&p.a), method_of(&p.b)])
            .collect();
        let methods: Vec<&str> = methods.into_iter().collect();

        Ok(TraitEvaluation::new(trait_name, pairs.len(), aggregate, &methods))
    }

    /// Evaluate every trait in `datasets` (`trait -> id -> item`). Stops
    /// starting new traits once `cancel` fires or a trait aborts under
    /// fail-fast; either way the report keeps what was judged.
    pub async fn evaluate(
        &self,
        datasets: BTreeMap<String, BTreeMap<String, SjtItem>>,
        methods: &[String],
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport> {
        let mut traits = BTreeMap::new();
        let mut usage = TokenUsage::default();
        let mut complete = true;
        let mut failure = None;

        for (trait_name, items) in datasets {
            if cancel.is_cancelled() {
                complete = false;
                break;
            }
            let ids: Vec<&String> = items.keys().collect();
            let planned = generate_pairs(&ids).len();

            let mut evaluation = match self.evaluate_trait(&trait_name, items, cancel).await {
                Ok(evaluation) => evaluation,
                Err(PipelineError::Batch { failure: aborted, .. }) => {
                    let BatchFailure {
                        error,
                        batch,
                        cursor,
                        aggregate,
                    } = *aborted;
                    warn!(trait_name = %trait_name, batch, error = %error, "Evaluation aborted");
                    usage.add(aggregate.value.usage);
                    failure = Some(EvaluationFailure {
                        trait_name: trait_name.clone(),
                        batch,
                        cursor,
                        error,
                    });
                    let evaluation = TraitEvaluation::new(&trait_name, planned, aggregate, methods);
                    traits.insert(trait_name, evaluation);
                    complete = false;
                    break;
                }
                Err(e) => return Err(e),
            };
            // Rates against every requested method, even ones with no wins.
            evaluation.win_rates = win_rates(&evaluation.aggregate.value.judgments, methods);
            usage.add(evaluation.aggregate.value.usage);
            complete &= evaluation.aggregate.is_complete() && evaluation.aggregate.skipped.is_empty();
            traits.insert(trait_name, evaluation);
        }

        let by_trait: BTreeMap<String, WinRates> = traits
            .iter()
            .map(|(name, e)| (name.clone(), e.win_rates.clone()))
            .collect();
        let cost = self.rates.calculate_cost(&usage);
        info!(
            traits = traits.len(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost,
            complete,
            "Evaluation finished"
        );

        Ok(EvaluationReport {
            methods: methods.to_vec(),
            overall_win_rates: overall_win_rates(&by_trait),
            traits,
            usage,
            cost,
            complete,
            failure,
        })
    }
}
