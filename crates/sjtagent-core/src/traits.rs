use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::types::{ModelRequest, ModelResponse};

/// Generative model capability.
///
/// Implementations perform exactly one call; retries, timeouts and corrective
/// re-prompts are layered on top by `sjtagent_llm::retry`.
pub trait ModelClient: Send + Sync + 'static {
    fn invoke(
        &self,
        config: &ModelConfig,
        request: ModelRequest,
    ) -> BoxFuture<'_, std::result::Result<ModelResponse, ModelError>>;
}

/// Read-only access to seed content (trait definitions, item banks).
pub trait DataSource: Send + Sync {
    /// Load the record stored under `key`.
    fn load(&self, key: &str) -> Result<serde_json::Value>;
}
