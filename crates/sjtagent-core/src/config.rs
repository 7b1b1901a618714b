use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SjtError};
use crate::types::TokenUsage;

/// Top-level sjtagent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.4 }

/// What the batch coordinator does when one batch fails to evaluate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchErrorPolicy {
    /// Abort on the first failed batch and return the partial aggregate.
    FailFast,
    /// Record the failed batch as skipped and move on to the next one.
    #[default]
    SkipAndContinue,
}

/// Execution engine limits and the model-call retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard ceiling on entries into any single step during one run.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Per-step overrides of `max_steps`.
    #[serde(default)]
    pub step_limits: BTreeMap<String, u32>,
    #[serde(default = "default_per_step_timeout")]
    pub per_step_timeout_secs: u64,
    /// Maximum number of attempts for one model call, first attempt included.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub on_batch_error: BatchErrorPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            step_limits: BTreeMap::new(),
            per_step_timeout_secs: default_per_step_timeout(),
            retry_ceiling: default_retry_ceiling(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            on_batch_error: BatchErrorPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// The options recognized by `run` and `run_batches`.
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            max_steps: self.max_steps,
            step_limits: self.step_limits.clone(),
            per_step_timeout: Duration::from_secs(self.per_step_timeout_secs),
            retry_ceiling: self.retry_ceiling,
            on_batch_error: self.on_batch_error,
        }
    }
}

fn default_max_steps() -> u32 { 10 }
fn default_per_step_timeout() -> u64 { 120 }
fn default_retry_ceiling() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Per-run limits handed to the engine and the batch coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub max_steps: u32,
    pub step_limits: BTreeMap<String, u32>,
    pub per_step_timeout: Duration,
    pub retry_ceiling: u32,
    pub on_batch_error: BatchErrorPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        EngineConfig::default().run_config()
    }
}

/// Item generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Unsuccessful quality checks tolerated before the revision loop stops.
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
    #[serde(default = "default_population_profile")]
    pub population_profile: String,
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_revisions: default_max_revisions(),
            population_profile: default_population_profile(),
            language: default_language(),
        }
    }
}

fn default_max_revisions() -> u32 { 2 }
fn default_population_profile() -> String { "university students".to_string() }
fn default_language() -> String { "en".to_string() }

/// One axis along which two items are compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub description: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Pairwise evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent model calls within one batch.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Comparison dimensions. Empty means the standard SJT set.
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub cost: CostConfig,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            dimensions: Vec::new(),
            cost: CostConfig::default(),
        }
    }
}

fn default_batch_size() -> usize { 10 }
fn default_max_concurrent() -> usize { 5 }

/// Token prices, per one million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CostConfig {
    #[serde(default = "default_input_rate")]
    pub input_token_rate: f64,
    #[serde(default = "default_output_rate")]
    pub output_token_rate: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            input_token_rate: default_input_rate(),
            output_token_rate: default_output_rate(),
        }
    }
}

impl CostConfig {
    /// Price of `usage` in the configured currency.
    pub fn calculate_cost(&self, usage: &TokenUsage) -> f64 {
        let input = usage.input_tokens as f64 / 1_000_000.0 * self.input_token_rate;
        let output = usage.output_tokens as f64 / 1_000_000.0 * self.output_token_rate;
        input + output
    }
}

fn default_input_rate() -> f64 { 0.8 }
fn default_output_rate() -> f64 { 2.0 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SjtError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| SjtError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_steps == 0 {
            return Err(SjtError::Config("engine.max_steps must be at least 1".into()));
        }
        if self.engine.retry_ceiling == 0 {
            return Err(SjtError::Config(
                "engine.retry_ceiling must be at least 1".into(),
            ));
        }
        if self.evaluation.batch_size == 0 {
            return Err(SjtError::Config(
                "evaluation.batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference verbatim so the failure is visible later
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
