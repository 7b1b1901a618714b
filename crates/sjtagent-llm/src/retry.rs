use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use sjtagent_core::config::{EngineConfig, ModelConfig};
use sjtagent_core::error::{ModelError, ModelErrorKind};
use sjtagent_core::traits::ModelClient;
use sjtagent_core::types::{ChatMessage, ModelRequest, TokenUsage};

const CORRECTIVE_PROMPT: &str = "Your previous answer could not be parsed ({reason}). \
Reply again with ONLY a valid JSON object in exactly the requested format, with no commentary.";

/// Retry policy for one structured model call.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    /// Maximum number of attempts, first attempt included.
    pub retry_ceiling: u32,
    pub per_call_timeout: Duration,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl CallPolicy {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            retry_ceiling: config.retry_ceiling,
            per_call_timeout: Duration::from_secs(config.per_step_timeout_secs),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }

    /// A policy that never sleeps between attempts.
    pub fn immediate(retry_ceiling: u32, per_call_timeout: Duration) -> Self {
        Self {
            retry_ceiling,
            per_call_timeout,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

/// A successfully parsed answer.
#[derive(Debug, Clone)]
pub struct CallOutcome<T> {
    pub value: T,
    pub attempts: u32,
    /// Usage summed over every attempt, failed ones included.
    pub usage: TokenUsage,
}

/// The call gave up; `last` is the error of the final attempt.
#[derive(Debug, Clone, Error)]
#[error("model call failed after {attempts} attempt(s): {last}")]
pub struct CallError {
    pub attempts: u32,
    pub last: ModelError,
    pub usage: TokenUsage,
}

fn calculate_backoff(retry: u32, policy: &CallPolicy) -> Duration {
    let ms = policy
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(retry))
        .min(policy.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Invoke `client` and parse its answer with `parse`, under `policy`.
///
/// - every attempt is bounded by `per_call_timeout`; expiry counts as `Timeout`
/// - `Timeout`, `RateLimited`, `Unavailable` back off exponentially and retry
/// - `MalformedOutput` earns one corrective re-prompt, then escalates
/// - no more than `retry_ceiling` attempts are made in total
pub async fn call_structured<T, F>(
    client: &dyn ModelClient,
    model: &ModelConfig,
    request: ModelRequest,
    policy: &CallPolicy,
    parse: F,
) -> Result<CallOutcome<T>, CallError>
where
    F: Fn(&str) -> Result<T, ModelError>,
{
    let ceiling = policy.retry_ceiling.max(1);
    let mut request = request;
    let mut usage = TokenUsage::default();
    let mut corrected = false;
    let mut transient_retries = 0u32;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let mut raw_text = None;
        let result = match tokio::time::timeout(
            policy.per_call_timeout,
            client.invoke(model, request.clone()),
        )
        .await
        {
            Ok(Ok(response)) => {
                usage.add(response.usage);
                let parsed = parse(&response.text);
                raw_text = Some(response.text);
                parsed
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ModelError::timeout(format!(
                "no response within {}ms",
                policy.per_call_timeout.as_millis()
            ))),
        };

        let err = match result {
            Ok(value) => {
                debug!(attempt, "Structured model call succeeded");
                return Ok(CallOutcome {
                    value,
                    attempts: attempt,
                    usage,
                });
            }
            Err(e) => e,
        };

        if attempt >= ceiling {
            warn!(attempts = attempt, error = %err, "Model call retries exhausted");
            return Err(CallError {
                attempts: attempt,
                last: err,
                usage,
            });
        }

        match err.kind {
            kind if kind.is_transient() => {
                let backoff = calculate_backoff(transient_retries, policy);
                transient_retries += 1;
                warn!(
                    attempt,
                    retry_ceiling = ceiling,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Retrying model call"
                );
                tokio::time::sleep(backoff).await;
            }
            ModelErrorKind::MalformedOutput if !corrected => {
                corrected = true;
                warn!(attempt, error = %err, "Malformed model output, re-prompting once");
                if let Some(text) = raw_text {
                    request.messages.push(ChatMessage::assistant(text));
                }
                request.messages.push(ChatMessage::user(
                    CORRECTIVE_PROMPT.replace("{reason}", &err.message),
                ));
            }
            _ => {
                warn!(attempt, error = %err, "Model output still malformed after correction");
                return Err(CallError {
                    attempts: attempt,
                    last: err,
                    usage,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sjtagent_core::types::ModelResponse;
    use sjtagent_test_utils::{DelayedModel, ScriptedModel};

    use crate::json::parse_json_object;

    fn model() -> ModelConfig {
        ModelConfig::new("test-model")
    }

    fn request() -> ModelRequest {
        ModelRequest::new(vec![ChatMessage::user("give me JSON")])
    }

    #[tokio::test]
    async fn test_rate_limited_exhausts_exactly_ceiling() {
        let client = ScriptedModel::always(Err(ModelError::rate_limited("429")));
        let policy = CallPolicy::immediate(4, Duration::from_secs(5));

        let err = call_structured(&client, &model(), request(), &policy, parse_json_object)
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 4);
        assert_eq!(err.last.kind, ModelErrorKind::RateLimited);
        assert_eq!(client.calls(), 4);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let client = ScriptedModel::new(vec![
            Err(ModelError::unavailable("503")),
            Err(ModelError::timeout("slow")),
            Ok(ModelResponse::text(r#"{"ok": true}"#)),
        ]);
        let policy = CallPolicy::immediate(3, Duration::from_secs(5));

        let outcome = call_structured(&client, &model(), request(), &policy, parse_json_object)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.value["ok"], true);
    }

    #[tokio::test]
    async fn test_malformed_gets_one_corrective_reprompt() {
        let client = ScriptedModel::new(vec![
            Ok(ModelResponse::text("sorry, here is prose")),
            Ok(ModelResponse::text(r#"{"fixed": 1}"#)),
        ]);
        let policy = CallPolicy::immediate(5, Duration::from_secs(5));

        let outcome = call_structured(&client, &model(), request(), &policy, parse_json_object)
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        let requests = client.requests();
        assert_eq!(requests[0].messages.len(), 1);
        // first prompt, echoed answer, corrective instruction
        assert_eq!(requests[1].messages.len(), 3);
        assert!(requests[1].messages[2].content.contains("could not be parsed"));
    }

    #[tokio::test]
    async fn test_malformed_twice_escalates() {
        let client = ScriptedModel::always(Ok(ModelResponse::text("not json")));
        let policy = CallPolicy::immediate(5, Duration::from_secs(5));

        let err = call_structured(&client, &model(), request(), &policy, parse_json_object)
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.last.kind, ModelErrorKind::MalformedOutput);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_per_call_timeout_is_retryable() {
        let inner = ScriptedModel::always(Ok(ModelResponse::text(r#"{"late": true}"#)));
        let client = DelayedModel::new(inner, Duration::from_millis(200));
        let policy = CallPolicy::immediate(2, Duration::from_millis(10));

        let err = call_structured(&client, &model(), request(), &policy, parse_json_object)
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.last.kind, ModelErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_usage_summed_across_attempts() {
        let bad = ModelResponse {
            text: "???".into(),
            usage: TokenUsage::new(10, 2),
        };
        let good = ModelResponse {
            text: "{}".into(),
            usage: TokenUsage::new(15, 1),
        };
        let client = ScriptedModel::new(vec![Ok(bad), Ok(good)]);
        let policy = CallPolicy::immediate(3, Duration::from_secs(5));

        let outcome = call_structured(&client, &model(), request(), &policy, parse_json_object)
            .await
            .unwrap();
        assert_eq!(outcome.usage, TokenUsage::new(25, 3));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = CallPolicy {
            retry_ceiling: 10,
            per_call_timeout: Duration::from_secs(1),
            initial_backoff_ms: 1000,
            max_backoff_ms: 4000,
        };
        let b = calculate_backoff(8, &policy);
        assert!(b <= Duration::from_millis(4800));
        assert!(b >= Duration::from_millis(3200));
    }
}
