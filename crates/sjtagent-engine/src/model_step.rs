use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use sjtagent_core::config::ModelConfig;
use sjtagent_core::error::ModelError;
use sjtagent_core::traits::ModelClient;
use sjtagent_core::types::{ModelRequest, TokenUsage};
use sjtagent_llm::{call_structured, parse_json_object, CallPolicy};

use crate::error::StepFailure;
use crate::graph::{State, StateUpdate, Step};

/// State field holding the token usage accumulated by model steps.
pub const USAGE_FIELD: &str = "usage";

/// The prompt side of a model-backed step: how to ask, and how to read the
/// answer back into state.
pub trait StepPrompt: Send + Sync {
    fn build(&self, state: &State) -> Result<ModelRequest, StepFailure>;

    /// Turn the parsed JSON answer into an update. An `Err` marks the answer
    /// as malformed, which earns the model one corrective re-prompt.
    fn apply(&self, state: &State, answer: serde_json::Value) -> Result<StateUpdate, String>;

    fn labels(&self) -> Vec<String> {
        Vec::new()
    }

    fn writes(&self) -> Option<Vec<String>> {
        None
    }
}

/// A step that asks a model for one JSON object.
///
/// Retries, timeouts and the corrective re-prompt come from
/// [`call_structured`]; once they are exhausted the step fails and the
/// engine stops the run.
pub struct ModelStep<P> {
    name: String,
    prompt: P,
    client: Arc<dyn ModelClient>,
    model: ModelConfig,
    policy: CallPolicy,
}

impl<P: StepPrompt> ModelStep<P> {
    pub fn new(
        name: impl Into<String>,
        prompt: P,
        client: Arc<dyn ModelClient>,
        model: ModelConfig,
        policy: CallPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            prompt,
            client,
            model,
            policy,
        }
    }
}

impl<P: StepPrompt> Step for ModelStep<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> Vec<String> {
        self.prompt.labels()
    }

    fn writes(&self) -> Option<Vec<String>> {
        self.prompt.writes().map(|mut keys| {
            keys.push(USAGE_FIELD.to_string());
            keys
        })
    }

    fn execute<'a>(&'a self, state: &'a State) -> BoxFuture<'a, Result<StateUpdate, StepFailure>> {
        Box::pin(async move {
            let request = self.prompt.build(state)?;
            let outcome = call_structured(
                self.client.as_ref(),
                &self.model,
                request,
                &self.policy,
                |text| {
                    let value = parse_json_object(text)?;
                    self.prompt.apply(state, value).map_err(ModelError::malformed)
                },
            )
            .await
            .map_err(|e| StepFailure::exhausted(&self.name, e))?;

            debug!(
                step = %self.name,
                attempts = outcome.attempts,
                input_tokens = outcome.usage.input_tokens,
                output_tokens = outcome.usage.output_tokens,
                "Model step answered"
            );

            let mut usage: TokenUsage = state.get_as(USAGE_FIELD).unwrap_or_default();
            usage.add(outcome.usage);
            outcome
                .value
                .set_json(USAGE_FIELD, &usage)
                .map_err(|e| StepFailure::new(format!("{}: {}", self.name, e)))
        })
    }
}
