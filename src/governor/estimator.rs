//! Token cost estimation.
//!
//! The scheduler compares estimates against a budget expressed in the
//! server's token units, so estimates only need to be consistent, not exact.
//! Costs are derived from character and word counts.

use serde::{Deserialize, Serialize};

use super::payload::Payload;
use crate::config::EstimatorConfig;

/// Token estimation strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimationMethod {
    /// Simple character-based estimation (~3.5 chars per token)
    CharacterBased,
    /// Word-based estimation (1 word ≈ 1.3 tokens)
    WordBased,
    /// Higher of the two, with a safety margin
    #[default]
    Conservative,
}

/// Estimates the token cost of a payload.
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    method: EstimationMethod,
    safety_margin: f64,
    message_overhead: u64,
    completion_allowance: u64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::from_config(&EstimatorConfig::default())
    }
}

impl TokenEstimator {
    /// Create an estimator using the given method without any overheads.
    pub fn new(method: EstimationMethod) -> Self {
        let safety_margin = match method {
            EstimationMethod::CharacterBased | EstimationMethod::WordBased => 1.0,
            EstimationMethod::Conservative => 1.2,
        };
        Self {
            method,
            safety_margin,
            message_overhead: 0,
            completion_allowance: 0,
        }
    }

    /// Create a conservative estimator from configuration.
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self {
            method: EstimationMethod::Conservative,
            safety_margin: config.safety_margin.max(1.0),
            message_overhead: config.message_overhead,
            completion_allowance: config.completion_allowance,
        }
    }

    /// Estimate tokens for a piece of text.
    pub fn estimate(&self, text: &str) -> u64 {
        let base_estimate = match self.method {
            EstimationMethod::CharacterBased => estimate_by_chars(text),
            EstimationMethod::WordBased => estimate_by_words(text),
            EstimationMethod::Conservative => estimate_by_chars(text).max(estimate_by_words(text)),
        };

        (base_estimate as f64 * self.safety_margin).ceil() as u64
    }

    /// Estimate the full cost of submitting a payload.
    ///
    /// Counts the content and instruction as separate messages, each with the
    /// configured overhead, plus the completion allowance.
    pub fn estimate_payload(&self, payload: &Payload) -> u64 {
        let mut total = self.estimate(&payload.content) + self.message_overhead;
        if let Some(instruction) = &payload.instruction {
            total += self.estimate(instruction) + self.message_overhead;
        }
        total + self.completion_allowance
    }
}

fn estimate_by_chars(text: &str) -> u64 {
    let chars = text.chars().count();
    (chars as f64 / 3.5).ceil() as u64
}

fn estimate_by_words(text: &str) -> u64 {
    let words = text.split_whitespace().count();
    (words as f64 * 1.3).ceil() as u64
}
