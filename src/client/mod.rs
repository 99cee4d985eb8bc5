//! Transport implementations for the governor.

mod openai;

pub use openai::{classify_response, ChatCompletionsConfig, ChatCompletionsTransport};
