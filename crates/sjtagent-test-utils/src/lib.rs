//! Model stubs shared by the sjtagent test suites.
//!
//! None of these make network calls. `ScriptedModel` replays a fixed queue of
//! answers, `FnModel` answers from the request content (useful when calls run
//! concurrently and arrive in any order), `DelayedModel` adds latency to
//! exercise timeouts and cancellation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use sjtagent_core::config::ModelConfig;
use sjtagent_core::error::ModelError;
use sjtagent_core::traits::ModelClient;
use sjtagent_core::types::{ModelRequest, ModelResponse};

type Answer = Result<ModelResponse, ModelError>;

/// Shorthand for a successful text answer.
pub fn ok(text: impl Into<String>) -> Answer {
    Ok(ModelResponse::text(text))
}

/// Replays scripted answers in order. Once the script runs dry the
/// `fallback` answer (if any) repeats forever; otherwise calls fail with
/// `Unavailable`.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Answer>>,
    fallback: Option<Answer>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(answers: Vec<Answer>) -> Self {
        Self {
            script: Mutex::new(answers.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call the same way.
    pub fn always(answer: Answer) -> Self {
        Self::new(vec![]).with_fallback(answer)
    }

    pub fn with_fallback(mut self, answer: Answer) -> Self {
        self.fallback = Some(answer);
        self
    }

    /// Number of `invoke` calls observed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn invoke(&self, _config: &ModelConfig, request: ModelRequest) -> BoxFuture<'_, Answer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        let answer = next
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Err(ModelError::unavailable("script exhausted")));
        Box::pin(async move { answer })
    }
}

/// Answers computed from each request.
pub struct FnModel<F> {
    respond: F,
    calls: AtomicUsize,
}

impl<F> FnModel<F>
where
    F: Fn(&ModelRequest) -> Answer + Send + Sync + 'static,
{
    pub fn new(respond: F) -> Self {
        Self {
            respond,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> ModelClient for FnModel<F>
where
    F: Fn(&ModelRequest) -> Answer + Send + Sync + 'static,
{
    fn invoke(&self, _config: &ModelConfig, request: ModelRequest) -> BoxFuture<'_, Answer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = (self.respond)(&request);
        Box::pin(async move { answer })
    }
}

/// Wraps another client and sleeps before every answer.
pub struct DelayedModel<M> {
    inner: M,
    delay: Duration,
}

impl<M: ModelClient> DelayedModel<M> {
    pub fn new(inner: M, delay: Duration) -> Self {
        Self { inner, delay }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

impl<M: ModelClient> ModelClient for DelayedModel<M> {
    fn invoke(&self, config: &ModelConfig, request: ModelRequest) -> BoxFuture<'_, Answer> {
        let config = config.clone();
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.invoke(&config, request).await
        })
    }
}

/// The last user message of a request, which is where prompts put the payload.
pub fn last_user_text(request: &ModelRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == sjtagent_core::types::Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// Render a JSON value as a model answer.
pub fn json_answer(value: serde_json::Value) -> Answer {
    ok(value.to_string())
}
