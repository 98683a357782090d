//! Model backends: the network seam under the inference adapter.
//!
//! A [`ModelBackend`] turns one chat request into one text completion. It
//! knows nothing about rate limits or retries; those live in
//! [`InferenceAdapter`](super::InferenceAdapter). Errors are plain strings
//! so the retry module can classify them by content.

use crate::{Message, OPENROUTER_URL};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Boxed future returned by [`ModelBackend::complete`].
pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// One chat completion request.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Something that can answer a chat request with text.
pub trait ModelBackend: Send + Sync {
    fn complete<'a>(&'a self, request: &'a ModelRequest) -> BackendFuture<'a>;
}

impl<B: ModelBackend + ?Sized> ModelBackend for std::sync::Arc<B> {
    fn complete<'a>(&'a self, request: &'a ModelRequest) -> BackendFuture<'a> {
        (**self).complete(request)
    }
}

// ── Closure backend ────────────────────────────────────────────────

/// A backend answered by a synchronous closure. Handy for tests and for
/// wiring in local models.
pub struct FnBackend<F> {
    func: F,
}

impl<F> FnBackend<F>
where
    F: Fn(&ModelRequest) -> Result<String, String> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> ModelBackend for FnBackend<F>
where
    F: Fn(&ModelRequest) -> Result<String, String> + Send + Sync,
{
    fn complete<'a>(&'a self, request: &'a ModelRequest) -> BackendFuture<'a> {
        let result = (self.func)(request);
        Box::pin(async move { result })
    }
}

// ── OpenRouter ─────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug, Clone)]
struct UsageInfo {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    url: String,
    referer: String,
    title: String,
}

impl OpenRouterClient {
    /// Create a client with the default endpoint and headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, String> {
        Self::with_timeout(api_key, Duration::from_secs(120))
    }

    /// Create a client whose HTTP requests give up after `timeout`.
    pub fn with_timeout(api_key: impl Into<String>, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("promptopt/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            url: OPENROUTER_URL.to_string(),
            referer: "https://github.com/promptopt".to_string(),
            title: "promptopt".to_string(),
        })
    }

    /// Point at a different OpenAI-compatible endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    async fn chat(&self, body: &ModelRequest) -> Result<String, String> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={}, temp={}",
            body.model,
            body.messages.len(),
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }
        parse_completion(&text)
    }
}

fn parse_completion(text: &str) -> Result<String, String> {
    let parsed: RawChatResponse =
        serde_json::from_str(text).map_err(|e| format!("failed to parse response: {e}"))?;

    if let Some(err) = parsed.error {
        return Err(format!("OpenRouter API error: {}", err.message));
    }
    if let Some(ref usage) = parsed.usage {
        debug!(
            "Token usage: prompt={}, completion={}",
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
        );
    }

    parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message.content)
        .ok_or_else(|| "Empty LLM response".to_string())
}

impl ModelBackend for OpenRouterClient {
    fn complete<'a>(&'a self, request: &'a ModelRequest) -> BackendFuture<'a> {
        Box::pin(self.chat(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_messages() {
        let req = ModelRequest {
            model: "test-model".into(),
            messages: vec![Message::system("s"), Message::user("u")],
            max_tokens: 100,
            temperature: 0.0,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "test-model");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "u");
    }

    #[test]
    fn parse_completion_extracts_first_choice() {
        let body = r#"{"choices":[{"message":{"content":"hello"}}],"usage":{"prompt_tokens":3}}"#;
        assert_eq!(parse_completion(body).unwrap(), "hello");
    }

    #[test]
    fn parse_completion_surfaces_api_errors() {
        let err = parse_completion(r#"{"error":{"message":"quota"}}"#).unwrap_err();
        assert_eq!(err, "OpenRouter API error: quota");
        let err = parse_completion(r#"{"choices":[]}"#).unwrap_err();
        assert_eq!(err, "Empty LLM response");
        assert!(parse_completion("not json").is_err());
    }

    #[tokio::test]
    async fn fn_backend_answers() {
        let backend = FnBackend::new(|req: &ModelRequest| Ok(format!("echo {}", req.model)));
        let req = ModelRequest {
            model: "m".into(),
            messages: vec![],
            max_tokens: 1,
            temperature: 0.0,
        };
        assert_eq!(backend.complete(&req).await.unwrap(), "echo m");
    }
}
