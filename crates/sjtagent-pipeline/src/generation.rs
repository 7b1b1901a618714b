//! SJT item generation.
//!
//! ```text
//! trait_analysis -> situation_construction -> behavior_adaptation -> quality_check
//!                                                   ^                    | revise
//!                                                   +------ revise <-----+
//!                                                                        | stop -> END
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use sjtagent_core::config::{AppConfig, GenerationConfig, ModelConfig};
use sjtagent_core::traits::ModelClient;
use sjtagent_core::types::{ChatMessage, ModelRequest, RunId, TokenUsage};
use sjtagent_engine::{
    Engine, FnStep, Graph, GraphError, ModelStep, RunStatus, State, StateUpdate, StepFailure,
    StepPrompt, StepRecord, END, USAGE_FIELD,
};
use sjtagent_llm::CallPolicy;

use crate::error::{PipelineError, Result};
use crate::prompts::{self, render};
use crate::quality::{self, BehaviorOption, QualityReport};

pub const TOOL_NAME: &str = "sjtagent";

/// State fields of a generation run.
pub mod fields {
    pub const REQUEST_ID: &str = "request_id";
    pub const TRAIT_NAME: &str = "trait_name";
    pub const BFI_ITEM: &str = "bfi_item";
    pub const POPULATION_PROFILE: &str = "population_profile";
    pub const LANGUAGE: &str = "language";
    pub const TRAIT_ANALYSIS: &str = "trait_analysis";
    pub const SITUATION_OUTLINE: &str = "situation_outline";
    pub const SCENARIO_TEXT: &str = "scenario_text";
    pub const OPTIONS: &str = "options";
    pub const QUALITY: &str = "quality";
    pub const REVISE_NOTES: &str = "revise_notes";
    /// Counter: revisions performed so far.
    pub const ITER: &str = "iter";
}

/// What to generate an item for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub trait_name: String,
    /// Self-report item the situation should translate.
    pub bfi_item: String,
    pub population_profile: String,
    pub language: String,
}

impl GenerationRequest {
    pub fn new(trait_name: impl Into<String>, bfi_item: impl Into<String>) -> Self {
        Self {
            trait_name: trait_name.into(),
            bfi_item: bfi_item.into(),
            population_profile: "university students".to_string(),
            language: "en".to_string(),
        }
    }

    /// Population and language taken from the `[generation]` config.
    pub fn configured(
        trait_name: impl Into<String>,
        bfi_item: impl Into<String>,
        config: &GenerationConfig,
    ) -> Self {
        Self {
            population_profile: config.population_profile.clone(),
            language: config.language.clone(),
            ..Self::new(trait_name, bfi_item)
        }
    }

    pub fn initial_state(&self, request_id: &RunId) -> State {
        State::new()
            .with(fields::REQUEST_ID, json!(request_id.0))
            .with(fields::TRAIT_NAME, json!(self.trait_name))
            .with(fields::BFI_ITEM, json!(self.bfi_item))
            .with(fields::POPULATION_PROFILE, json!(self.population_profile))
            .with(fields::LANGUAGE, json!(self.language))
    }
}

fn require_str<'a>(state: &'a State, key: &str) -> std::result::Result<&'a str, StepFailure> {
    state
        .get_str(key)
        .ok_or_else(|| StepFailure::new(format!("state field '{}' is missing", key)))
}

fn field_json(state: &State, key: &str, pointer: &str) -> String {
    state
        .get(key)
        .and_then(|v| v.pointer(pointer))
        .cloned()
        .unwrap_or_else(|| json!({}))
        .to_string()
}

fn language(state: &State) -> &str {
    state.get_str(fields::LANGUAGE).unwrap_or("en")
}

fn owned(keys: &[&str]) -> Option<Vec<String>> {
    Some(keys.iter().map(|k| k.to_string()).collect())
}

pub struct TraitAnalysisPrompt;

impl StepPrompt for TraitAnalysisPrompt {
    fn build(&self, state: &State) -> std::result::Result<ModelRequest, StepFailure> {
        let user = render(
            prompts::TRAIT_ANALYSIS_USER,
            &[
                ("trait_name", require_str(state, fields::TRAIT_NAME)?),
                ("bfi_item", require_str(state, fields::BFI_ITEM)?),
                ("population_profile", require_str(state, fields::POPULATION_PROFILE)?),
                ("language", language(state)),
            ],
        );
        Ok(ModelRequest::new(vec![
            ChatMessage::system(prompts::TRAIT_ANALYSIS_SYSTEM),
            ChatMessage::user(user),
        ]))
    }

    fn apply(&self, _state: &State, answer: Value) -> std::result::Result<StateUpdate, String> {
        if !answer.get("mapping").is_some_and(Value::is_object) {
            return Err("expected a 'mapping' object".into());
        }
        Ok(StateUpdate::new().set(fields::TRAIT_ANALYSIS, answer))
    }

    fn writes(&self) -> Option<Vec<String>> {
        owned(&[fields::TRAIT_ANALYSIS])
    }
}

pub struct SituationPrompt;

impl StepPrompt for SituationPrompt {
    fn build(&self, state: &State) -> std::result::Result<ModelRequest, StepFailure> {
        let mapping = field_json(state, fields::TRAIT_ANALYSIS, "/mapping");
        let user = render(
            prompts::SITUATION_USER,
            &[
                ("population_profile", require_str(state, fields::POPULATION_PROFILE)?),
                ("trait_name", require_str(state, fields::TRAIT_NAME)?),
                ("trait_mapping", mapping.as_str()),
                ("bfi_item", require_str(state, fields::BFI_ITEM)?),
                ("language", language(state)),
            ],
        );
        Ok(ModelRequest::new(vec![
            ChatMessage::system(prompts::SITUATION_SYSTEM),
            ChatMessage::user(user),
        ]))
    }

    fn apply(&self, _state: &State, answer: Value) -> std::result::Result<StateUpdate, String> {
        let scenario = answer
            .get("scenario_text")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or("expected a non-empty 'scenario_text' string")?;
        let outline = answer.get("outline").cloned().unwrap_or_else(|| json!({}));
        Ok(StateUpdate::new()
            .set_str(fields::SCENARIO_TEXT, scenario)
            .set(fields::SITUATION_OUTLINE, outline))
    }

    fn writes(&self) -> Option<Vec<String>> {
        owned(&[fields::SITUATION_OUTLINE, fields::SCENARIO_TEXT])
    }
}

fn parse_options(answer: &Value) -> std::result::Result<Vec<BehaviorOption>, String> {
    let raw = answer
        .get("options")
        .cloned()
        .ok_or("expected an 'options' array")?;
    let options: Vec<BehaviorOption> =
        serde_json::from_value(raw).map_err(|e| format!("invalid 'options': {}", e))?;
    if options.is_empty() {
        return Err("'options' is empty".into());
    }
    Ok(options)
}

pub struct BehaviorPrompt;

impl StepPrompt for BehaviorPrompt {
    fn build(&self, state: &State) -> std::result::Result<ModelRequest, StepFailure> {
        let outline = field_json(state, fields::SITUATION_OUTLINE, "");
        let glossary = field_json(state, fields::TRAIT_ANALYSIS, "/evidence_glossary");
        let mut user = render(
            prompts::BEHAVIOR_USER,
            &[
                ("scenario_text", require_str(state, fields::SCENARIO_TEXT)?),
                ("outline", outline.as_str()),
                ("glossary", glossary.as_str()),
                ("language", language(state)),
            ],
        );
        // After a revision, carry the reviewer's notes into the next draft.
        if let Some(notes) = state.get_str(fields::REVISE_NOTES).filter(|n| !n.is_empty()) {
            user.push_str("\nAddress these quality issues: ");
            user.push_str(notes);
            user.push_str("\nCurrent options for reference: ");
            user.push_str(&field_json(state, fields::OPTIONS, ""));
        }
        Ok(ModelRequest::new(vec![
            ChatMessage::system(prompts::BEHAVIOR_SYSTEM),
            ChatMessage::user(user),
        ]))
    }

    fn apply(&self, _state: &State, answer: Value) -> std::result::Result<StateUpdate, String> {
        let options = parse_options(&answer)?;
        StateUpdate::new()
            .set_json(fields::OPTIONS, &options)
            .map_err(|e| e.to_string())
    }

    fn writes(&self) -> Option<Vec<String>> {
        owned(&[fields::OPTIONS])
    }
}

pub struct RevisePrompt;

impl StepPrompt for RevisePrompt {
    fn build(&self, state: &State) -> std::result::Result<ModelRequest, StepFailure> {
        let outline = field_json(state, fields::SITUATION_OUTLINE, "");
        let options = field_json(state, fields::OPTIONS, "");
        let user = render(
            prompts::REVISE_USER,
            &[
                ("issues", state.get_str(fields::REVISE_NOTES).unwrap_or("")),
                ("scenario_text", require_str(state, fields::SCENARIO_TEXT)?),
                ("outline", outline.as_str()),
                ("options", options.as_str()),
                ("language", language(state)),
            ],
        );
        Ok(ModelRequest::new(vec![
            ChatMessage::system(prompts::REVISE_SYSTEM),
            ChatMessage::user(user),
        ]))
    }

    fn apply(&self, _state: &State, answer: Value) -> std::result::Result<StateUpdate, String> {
        let mut update = StateUpdate::new().increment(fields::ITER);
        if let Some(text) = answer
            .get("scenario_text")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
        {
            update = update.set_str(fields::SCENARIO_TEXT, text);
        }
        if answer.get("options").is_some() {
            let options = parse_options(&answer)?;
            update = update
                .set_json(fields::OPTIONS, &options)
                .map_err(|e| e.to_string())?;
        }
        Ok(update)
    }

    fn writes(&self) -> Option<Vec<String>> {
        owned(&[fields::SCENARIO_TEXT, fields::OPTIONS, fields::ITER])
    }
}

/// Pure gate: score the options, then emit `revise` or `stop`.
pub fn quality_check_step(max_revisions: u32) -> FnStep {
    FnStep::new("quality_check", move |state| {
        let options: Vec<BehaviorOption> = state.get_as(fields::OPTIONS).unwrap_or_default();
        let cues: Vec<String> = state
            .get(fields::SITUATION_OUTLINE)
            .and_then(|o| o.get("cues"))
            .and_then(|c| serde_json::from_value(c.clone()).ok())
            .unwrap_or_default();

        let report = quality::assess(&options, &cues);
        let notes = quality::revision_notes(&report).join("; ");
        let label = quality::decide(state.counter(fields::ITER), max_revisions, &report);

        StateUpdate::new()
            .set_json(fields::QUALITY, &report)
            .map(|u| u.set_str(fields::REVISE_NOTES, notes).with_label(label))
            .map_err(|e| StepFailure::new(e.to_string()))
    })
    .with_labels(&["revise", "stop"])
    .with_writes(&[fields::QUALITY, fields::REVISE_NOTES])
}

fn model_step<P: StepPrompt>(
    name: &str,
    prompt: P,
    client: &Arc<dyn ModelClient>,
    model: &ModelConfig,
    policy: &CallPolicy,
) -> ModelStep<P> {
    ModelStep::new(name, prompt, client.clone(), model.clone(), policy.clone())
}

/// Assemble and validate the generation workflow.
pub fn build_generation_graph(
    client: Arc<dyn ModelClient>,
    model: &ModelConfig,
    policy: &CallPolicy,
    max_revisions: u32,
) -> std::result::Result<Graph, GraphError> {
    Graph::builder()
        .add_step(model_step("trait_analysis", TraitAnalysisPrompt, &client, model, policy))
        .add_step(model_step("situation_construction", SituationPrompt, &client, model, policy))
        .add_step(model_step("behavior_adaptation", BehaviorPrompt, &client, model, policy))
        .add_step(quality_check_step(max_revisions))
        .add_step(model_step("revise", RevisePrompt, &client, model, policy))
        .set_entry("trait_analysis")
        .add_edge("trait_analysis", "situation_construction")
        .add_edge("situation_construction", "behavior_adaptation")
        .add_edge("behavior_adaptation", "quality_check")
        .add_conditional_edges("quality_check", [("revise", "revise"), ("stop", END)])
        .add_edge("revise", "behavior_adaptation")
        .build()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMeta {
    pub tool: String,
    pub version: String,
    pub model: String,
    pub iterations: u64,
}

/// A finished item as handed to writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedItem {
    pub id: String,
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub population_profile: String,
    pub bfi_item: String,
    pub scenario_text: String,
    pub options: Vec<BehaviorOption>,
    pub quality: Option<QualityReport>,
    pub outline: Value,
    pub trait_analysis: Value,
    #[serde(default)]
    pub usage: TokenUsage,
    pub meta: ItemMeta,
}

/// Project a final generation state onto a [`GeneratedItem`].
pub fn pack_item(state: &State, model_id: &str) -> Result<GeneratedItem> {
    let text = |key: &str| state.get_str(key).unwrap_or_default().to_string();
    let scenario_text = state
        .get_str(fields::SCENARIO_TEXT)
        .ok_or_else(|| PipelineError::Incomplete("no scenario_text was generated".into()))?
        .to_string();

    Ok(GeneratedItem {
        id: text(fields::REQUEST_ID),
        trait_name: text(fields::TRAIT_NAME),
        population_profile: text(fields::POPULATION_PROFILE),
        bfi_item: text(fields::BFI_ITEM),
        scenario_text,
        options: state.get_as(fields::OPTIONS).unwrap_or_default(),
        quality: state.get_as(fields::QUALITY),
        outline: state.get(fields::SITUATION_OUTLINE).cloned().unwrap_or_else(|| json!({})),
        trait_analysis: state.get(fields::TRAIT_ANALYSIS).cloned().unwrap_or_else(|| json!({})),
        usage: state.get_as(USAGE_FIELD).unwrap_or_default(),
        meta: ItemMeta {
            tool: TOOL_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model: model_id.to_string(),
            iterations: state.counter(fields::ITER),
        },
    })
}

/// What a cancelled generation run had produced when it stopped.
#[derive(Debug, Clone, Serialize)]
pub struct PartialGeneration {
    /// Always `false`; kept so written reports say so explicitly.
    pub complete: bool,
    pub run_id: String,
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub state: State,
    pub trace: Vec<StepRecord>,
}

impl PartialGeneration {
    pub fn usage(&self) -> TokenUsage {
        self.state.get_as(USAGE_FIELD).unwrap_or_default()
    }
}

/// Runs the generation workflow for one request at a time. Cheap to share;
/// concurrent `generate` calls use independent state.
pub struct Generator {
    graph: Graph,
    engine: Engine,
    model_id: String,
}

impl Generator {
    pub fn new(client: Arc<dyn ModelClient>, config: &AppConfig) -> Result<Self> {
        let policy = CallPolicy::from_engine(&config.engine);
        let graph = build_generation_graph(
            client,
            &config.model,
            &policy,
            config.generation.max_revisions,
        )?;
        Ok(Self {
            graph,
            engine: Engine::from_config(&config.engine.run_config()),
            model_id: config.model.model_id.clone(),
        })
    }

    pub fn from_parts(graph: Graph, engine: Engine, model_id: impl Into<String>) -> Self {
        Self {
            graph,
            engine,
            model_id: model_id.into(),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GeneratedItem> {
        let run_id = RunId::new();
        info!(run_id = %run_id, trait_name = %request.trait_name, "Generating item");

        let outcome = self
            .engine
            .run_with_cancel(&self.graph, request.initial_state(&run_id), cancel)
            .await?;
        if outcome.status == RunStatus::Cancelled {
            info!(run_id = %run_id, steps = outcome.trace.len(), "Generation cancelled");
            return Err(PipelineError::Cancelled(Box::new(PartialGeneration {
                complete: false,
                run_id: run_id.to_string(),
                trait_name: request.trait_name.clone(),
                state: outcome.state,
                trace: outcome.trace,
            })));
        }

        let item = pack_item(&outcome.state, &self.model_id)?;
        info!(
            run_id = %run_id,
            iterations = item.meta.iterations,
            passed = item.quality.as_ref().is_some_and(|q| q.pass),
            "Item generated"
        );
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use sjtagent_core::error::{ModelError, ModelErrorKind};
    use sjtagent_core::types::ModelResponse;
    use sjtagent_engine::FailureKind;
    use sjtagent_test_utils::{json_answer, FnModel, ScriptedModel};

    fn good_options() -> Value {
        json!({"options": [
            {"label": "A", "action": "split the deadline work in the group chat", "rationale": "plans ahead", "trait_level": "high"},
            {"label": "B", "action": "set a private deadline and tell the group chat", "rationale": "self-imposed structure", "trait_level": "high"},
            {"label": "C", "action": "follow the group chat and meet the deadline", "rationale": "goes along", "trait_level": "mid"},
            {"label": "D", "action": "start the night before the deadline", "rationale": "procrastinates", "trait_level": "low"},
            {"label": "E", "action": "mute the group chat and forget the deadline", "rationale": "disengages", "trait_level": "low"}
        ]})
    }

    fn weak_options() -> Value {
        json!({"options": [
            {"label": "A", "action": "do it", "rationale": "r", "trait_level": "high"},
            {"label": "B", "action": "do it", "rationale": "r", "trait_level": "high"}
        ]})
    }

    fn system_of(request: &ModelRequest) -> &str {
        request.messages.first().map(|m| m.content.as_str()).unwrap_or("")
    }

    /// Answers each step by its system prompt. `behavior` decides the options
    /// answer from the number of behaviour calls made so far.
    fn stub<B>(behavior: B) -> FnModel<impl Fn(&ModelRequest) -> std::result::Result<ModelResponse, ModelError> + Send + Sync + 'static>
    where
        B: Fn(usize) -> Value + Send + Sync + 'static,
    {
        let behavior_calls = AtomicUsize::new(0);
        FnModel::new(move |request: &ModelRequest| {
            let system = system_of(request);
            if system == prompts::TRAIT_ANALYSIS_SYSTEM {
                json_answer(json!({
                    "trait": "Conscientiousness",
                    "components": {"cognition": [], "affect": [], "behavior": []},
                    "mapping": {"observable_cues": ["deadline", "group chat"]},
                    "evidence_glossary": {"high": ["organized"], "low": ["careless"]}
                }))
            } else if system == prompts::SITUATION_SYSTEM {
                json_answer(json!({
                    "outline": {"prototype": "time pressure", "cues": ["deadline", "group chat"]},
                    "scenario_text": "Your group project deadline is in three days and the group chat is silent."
                }))
            } else if system == prompts::BEHAVIOR_SYSTEM {
                let n = behavior_calls.fetch_add(1, Ordering::SeqCst);
                json_answer(behavior(n))
            } else if system == prompts::REVISE_SYSTEM {
                json_answer(json!({"scenario_text": "Revised: the deadline moved up and the group chat is silent."}))
            } else {
                Err(ModelError::unavailable("unexpected prompt"))
            }
        })
    }

    fn policy() -> CallPolicy {
        CallPolicy::immediate(3, Duration::from_secs(5))
    }

    fn generator(client: Arc<dyn ModelClient>, max_revisions: u32) -> Generator {
        let model = ModelConfig::new("test-model");
        let graph = build_generation_graph(client, &model, &policy(), max_revisions).unwrap();
        Generator::from_parts(graph, Engine::new(10), "test-model")
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("Conscientiousness", "I get chores done right away.")
    }

    #[tokio::test]
    async fn test_passing_item_needs_no_revision() {
        let client = Arc::new(stub(|_| good_options()));
        let item = generator(client.clone(), 2)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(item.meta.iterations, 0);
        assert_eq!(item.meta.model, "test-model");
        assert_eq!(item.meta.tool, TOOL_NAME);
        assert_eq!(item.options.len(), 5);
        assert!(item.quality.unwrap().pass);
        assert_eq!(item.trait_name, "Conscientiousness");
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_failing_item_stops_after_max_revisions() {
        let client = Arc::new(stub(|_| weak_options()));
        let item = generator(client.clone(), 2)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(item.meta.iterations, 2);
        assert!(!item.quality.unwrap().pass);
        assert!(item.scenario_text.starts_with("Revised:"));
        // analysis, situation, 3 behaviour drafts, 2 revisions
        assert_eq!(client.calls(), 7);
    }

    #[tokio::test]
    async fn test_revision_recovers() {
        let client = Arc::new(stub(|n| if n == 0 { weak_options() } else { good_options() }));
        let item = generator(client, 2)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(item.meta.iterations, 1);
        assert!(item.quality.unwrap().pass);
    }

    #[tokio::test]
    async fn test_generation_is_deterministic() {
        let run = || async {
            let client: Arc<dyn ModelClient> = Arc::new(stub(|_| weak_options()));
            let graph = build_generation_graph(client, &ModelConfig::new("m"), &policy(), 2).unwrap();
            let state = request().initial_state(&RunId::from("fixed"));
            let outcome = Engine::new(10).run(&graph, state).await.unwrap();
            serde_json::to_string(&outcome.state).unwrap()
        };
        assert_eq!(run().await, run().await);
    }

    #[tokio::test]
    async fn test_engine_ceiling_backs_up_domain_bound() {
        // A revision bound above the engine ceiling trips IterationLimitExceeded.
        let client: Arc<dyn ModelClient> = Arc::new(stub(|_| weak_options()));
        let graph = build_generation_graph(client, &ModelConfig::new("m"), &policy(), 100).unwrap();
        let err = Engine::new(3)
            .run(&graph, request().initial_state(&RunId::new()))
            .await
            .unwrap_err();

        assert_eq!(err.kind, FailureKind::IterationLimitExceeded);
        assert_eq!(err.step, "behavior_adaptation");
        assert_eq!(err.last_state.counter(fields::ITER), 3);
    }

    #[tokio::test]
    async fn test_rate_limited_model_aborts_run() {
        let client = Arc::new(ScriptedModel::always(Err(ModelError::rate_limited("429"))));
        let err = generator(client.clone(), 2)
            .generate(&request(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            PipelineError::Run(failure) => {
                assert_eq!(failure.kind, FailureKind::StepError);
                assert_eq!(failure.step, "trait_analysis");
                let cause = failure.cause.unwrap();
                assert_eq!(cause.attempts, 3);
                assert_eq!(cause.model_error, Some(ModelErrorKind::RateLimited));
            }
            other => panic!("expected run failure, got {other:?}"),
        }
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = Arc::new(stub(|_| good_options()));
        let err = generator(client.clone(), 2)
            .generate(&request(), &cancel)
            .await
            .unwrap_err();

        match err {
            PipelineError::Cancelled(partial) => {
                assert!(!partial.complete);
                assert!(partial.trace.is_empty());
                assert_eq!(partial.state.get_str(fields::TRAIT_NAME), Some("Conscientiousness"));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_mid_run_returns_partial_state() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let client = Arc::new(FnModel::new(move |request: &ModelRequest| {
            if system_of(request) != prompts::TRAIT_ANALYSIS_SYSTEM {
                return Err(ModelError::unavailable("unexpected prompt"));
            }
            trigger.cancel();
            Ok(ModelResponse {
                text: json!({"trait": "Conscientiousness", "mapping": {"observable_cues": ["deadline"]}})
                    .to_string(),
                usage: TokenUsage::new(40, 8),
            })
        }));

        let err = generator(client.clone(), 2)
            .generate(&request(), &cancel)
            .await
            .unwrap_err();

        let PipelineError::Cancelled(partial) = err else {
            panic!("expected cancellation, got {err:?}");
        };
        assert!(!partial.complete);
        assert_eq!(partial.trait_name, "Conscientiousness");
        let steps: Vec<_> = partial.trace.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, vec!["trait_analysis"]);
        assert!(partial.state.get(fields::TRAIT_ANALYSIS).is_some());
        assert!(partial.state.get(fields::SCENARIO_TEXT).is_none());
        assert_eq!(partial.usage(), TokenUsage::new(40, 8));
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn test_pack_item_requires_scenario() {
        let err = pack_item(&request().initial_state(&RunId::new()), "m").unwrap_err();
        assert!(matches!(err, PipelineError::Incomplete(_)));
    }

    #[test]
    fn test_trait_analysis_rejects_missing_mapping() {
        let err = TraitAnalysisPrompt
            .apply(&State::new(), json!({"trait": "x"}))
            .unwrap_err();
        assert!(err.contains("mapping"));
    }

    #[test]
    fn test_revise_keeps_stem_when_omitted() {
        let update = RevisePrompt
            .apply(&State::new(), json!({"options": [{"label": "A", "action": "a"}]}))
            .unwrap();
        assert!(update.get(fields::SCENARIO_TEXT).is_none());
        assert!(update.get(fields::OPTIONS).is_some());
        assert!(update.touched().any(|k| k == fields::ITER));
    }

    #[test]
    fn test_configured_request_uses_generation_config() {
        let config = GenerationConfig {
            population_profile: "nurses".into(),
            language: "zh".into(),
            ..GenerationConfig::default()
        };
        let request = GenerationRequest::configured("Agreeableness", "I am helpful.", &config);
        let state = request.initial_state(&RunId::from("r1"));
        assert_eq!(state.get_str(fields::POPULATION_PROFILE), Some("nurses"));
        assert_eq!(state.get_str(fields::LANGUAGE), Some("zh"));
        assert_eq!(state.get_str(fields::REQUEST_ID), Some("r1"));
    }
}
