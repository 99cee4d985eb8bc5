//! OpenAI-compatible chat-completions transport.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::governor::{Completion, Payload, RateLimitHeaders, Transport, TransportError};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Connection and sampling settings for the chat-completions endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletionsConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// 0 to 2; lower is more deterministic.
    pub temperature: f32,
    /// Nucleus sampling probability mass.
    pub top_p: f32,
    pub timeout: Duration,
}

impl ChatCompletionsConfig {
    /// Settings with the given key and default model parameters.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.5,
            top_p: 0.8,
            timeout: Duration::from_secs(120),
        }
    }

    /// Read `OPENAI_API_KEY`, and optionally `OPENAI_BASE_URL` and
    /// `PAGEGIST_MODEL`, from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingEnv("OPENAI_API_KEY"))?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(model) = env::var("PAGEGIST_MODEL") {
            config.model = model;
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    top_p: f32,
    messages: Vec<ChatMessage<'a>>,
}

impl<'a> ChatRequest<'a> {
    fn new(config: &'a ChatCompletionsConfig, payload: &'a Payload) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(instruction) = &payload.instruction {
            messages.push(ChatMessage {
                role: "system",
                content: instruction,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &payload.content,
        });
        Self {
            model: &config.model,
            temperature: config.temperature,
            top_p: config.top_p,
            messages,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Transport that posts payloads to `{base_url}/chat/completions`.
#[derive(Debug, Clone)]
pub struct ChatCompletionsTransport {
    client: reqwest::Client,
    config: ChatCompletionsConfig,
}

impl ChatCompletionsTransport {
    pub fn new(config: ChatCompletionsConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ChatCompletionsConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for ChatCompletionsTransport {
    async fn send(&self, payload: &Payload) -> Result<Completion, TransportError> {
        let request = ChatRequest::new(&self.config, payload);
        let response = self
            .client
            .post(self.config.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| TransportError::Transient(err.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|err| TransportError::Transient(err.to_string()))?;
        debug!(status = status.as_u16(), bytes = body.len(), "chat completion response");

        classify_response(status, &headers, &body)
    }
}

/// Map an HTTP response to a completion or a classified failure.
///
/// 429 is throttling, 408/409/5xx are transient, other non-success codes and
/// success bodies without a message are fatal.
pub fn classify_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> Result<Completion, TransportError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(TransportError::Throttled(RateLimitHeaders::from_headers(
            headers,
        )));
    }
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::CONFLICT
        || status.is_server_error()
    {
        return Err(TransportError::Transient(format!(
            "{}: {}",
            status,
            truncate(body)
        )));
    }
    if !status.is_success() {
        return Err(TransportError::Fatal(format!("{}: {}", status, truncate(body))));
    }

    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|err| TransportError::Fatal(format!("malformed response: {err}")))?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| TransportError::Fatal("no message in response".to_string()))?;
    Ok(Completion::from_text(text))
}

fn truncate(body: &str) -> &str {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
