//! The unit of work submitted to the text-generation service.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content plus an optional system instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload {
    /// The user message, typically a chunk of page text.
    pub content: String,
    /// Optional system instruction for the model.
    pub instruction: Option<String>,
}

impl Payload {
    /// Create a payload without an instruction.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            instruction: None,
        }
    }

    /// Attach a system instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    /// Hex-encoded SHA-256 of the content followed by the instruction.
    ///
    /// This is the identity used by the cache and the coalescer.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        if let Some(instruction) = &self.instruction {
            hasher.update(instruction.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}
