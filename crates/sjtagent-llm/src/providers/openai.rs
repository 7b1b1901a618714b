use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sjtagent_core::config::ModelConfig;
use sjtagent_core::error::ModelError;
use sjtagent_core::traits::ModelClient;
use sjtagent_core::types::{ChatMessage, ModelRequest, ModelResponse, Role, TokenUsage};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DASHSCOPE_API_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions";
const OLLAMA_API_URL: &str = "http://localhost:11434/v1/chat/completions";

/// OpenAI-compatible chat-completions client. Works with OpenAI, DashScope
/// (Qwen), Ollama, vLLM, OpenRouter, etc.
pub struct OpenAiCompatClient {
    http: Client,
}

impl OpenAiCompatClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiCompatClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the chat-completions URL: explicit `base_url` wins, otherwise the
/// provider's well-known endpoint.
pub fn endpoint(config: &ModelConfig) -> String {
    if let Some(base) = &config.base_url {
        let base = base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }
        return format!("{}/chat/completions", base);
    }
    match config.provider.as_str() {
        "qwen" | "dashscope" => DASHSCOPE_API_URL.to_string(),
        "ollama" => OLLAMA_API_URL.to_string(),
        _ => OPENAI_API_URL.to_string(),
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: &'static str,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    messages
        .into_iter()
        .map(|m| OaiMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content,
        })
        .collect()
}

/// Map an unsuccessful HTTP status onto the model error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> ModelError {
    let message = format!("HTTP {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        ModelError::rate_limited(message)
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        ModelError::timeout(message)
    } else {
        ModelError::unavailable(message)
    }
}

fn classify_transport(e: &reqwest::Error) -> ModelError {
    if e.is_timeout() {
        ModelError::timeout(e.to_string())
    } else if e.is_decode() {
        ModelError::malformed(e.to_string())
    } else {
        ModelError::unavailable(e.to_string())
    }
}

impl ModelClient for OpenAiCompatClient {
    fn invoke(
        &self,
        config: &ModelConfig,
        request: ModelRequest,
    ) -> BoxFuture<'_, Result<ModelResponse, ModelError>> {
        let config = config.clone();

        Box::pin(async move {
            let url = endpoint(&config);
            let body = ChatRequest {
                model: config.model_id.clone(),
                messages: convert_messages(request.messages),
                max_tokens: config.max_tokens,
                temperature: Some(request.temperature.unwrap_or(config.temperature)),
                stream: false,
            };

            let mut req = self.http.post(&url).json(&body);
            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req.send().await.map_err(|e| classify_transport(&e))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(classify_status(status, &body));
            }

            let parsed: ChatResponse = response.json().await.map_err(|e| classify_transport(&e))?;

            let text = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| ModelError::malformed("response carried no message content"))?;

            let usage = parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
                .unwrap_or_default();

            debug!(
                model = %config.model_id,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Model call complete"
            );

            Ok(ModelResponse { text, usage })
        })
    }
}
