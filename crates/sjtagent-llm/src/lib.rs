pub mod json;
pub mod providers;
pub mod retry;

use sjtagent_core::config::ModelConfig;
use sjtagent_core::traits::ModelClient;

pub use json::{extract_json, parse_json_object};
pub use providers::openai::OpenAiCompatClient;
pub use retry::{call_structured, CallError, CallOutcome, CallPolicy};

/// Create a model client for the configured provider.
///
/// Every supported provider speaks the OpenAI chat-completions dialect; the
/// provider name only selects the default endpoint (see `providers::openai`).
pub fn create_client(config: &ModelConfig) -> Box<dyn ModelClient> {
    tracing::debug!(provider = %config.provider, model = %config.model_id, "Creating model client");
    Box::new(OpenAiCompatClient::new())
}
