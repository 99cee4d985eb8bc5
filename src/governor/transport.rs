//! The boundary between the governor and the network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::payload::Payload;
use super::rate_limit::RateLimitHeaders;

/// A successful response from the text-generation service.
///
/// This is the value written to the content cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text, verbatim.
    pub text: String,
    /// The text parsed as JSON, when it is valid JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

impl Completion {
    /// Wrap generated text, parsing it as JSON when possible.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let json = serde_json::from_str(text.trim()).ok();
        Self { text, json }
    }
}

/// How a transport call failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server rejected the call because a rate limit was hit.
    #[error("throttled by server")]
    Throttled(RateLimitHeaders),

    /// A failure worth retrying after a delay.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A failure retrying will not fix, e.g. an unparseable response.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

/// Performs the actual call to the text-generation service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a payload and return the generated completion.
    async fn send(&self, payload: &Payload) -> Result<Completion, TransportError>;
}
