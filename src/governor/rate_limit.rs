//! Rate-limit metadata reported by the text-generation service.
//!
//! Supports the OpenAI-compatible `x-ratelimit-*` header family:
//! - `x-ratelimit-limit-tokens` / `x-ratelimit-remaining-tokens`
//! - `x-ratelimit-limit-requests` / `x-ratelimit-remaining-requests`
//! - `x-ratelimit-reset-tokens` / `x-ratelimit-reset-requests`
//!
//! Reset values use compound durations such as `6m0s`, `1.5s` or `20ms`.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::GovernorError;

/// Rate-limit fields as reported; any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    pub token_limit: Option<u64>,
    pub tokens_remaining: Option<u64>,
    pub requests_limit: Option<u64>,
    pub requests_remaining: Option<u64>,
    pub reset_tokens_in: Option<Duration>,
    pub reset_requests_in: Option<Duration>,
}

/// Complete rate-limit metadata carried by a throttling rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub token_limit: u64,
    pub tokens_remaining: u64,
    pub requests_limit: u64,
    pub requests_remaining: u64,
    pub reset_tokens_in: Duration,
    pub reset_requests_in: Duration,
}

impl RateLimitHeaders {
    /// Extract the `x-ratelimit-*` headers from a response.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            token_limit: header_u64(headers, "x-ratelimit-limit-tokens"),
            tokens_remaining: header_u64(headers, "x-ratelimit-remaining-tokens"),
            requests_limit: header_u64(headers, "x-ratelimit-limit-requests"),
            requests_remaining: header_u64(headers, "x-ratelimit-remaining-requests"),
            reset_tokens_in: header_duration(headers, "x-ratelimit-reset-tokens"),
            reset_requests_in: header_duration(headers, "x-ratelimit-reset-requests"),
        }
    }

    /// Require every field; the scheduler cannot reschedule safely otherwise.
    pub fn complete(&self) -> Result<RateLimitInfo, GovernorError> {
        Ok(RateLimitInfo {
            token_limit: self
                .token_limit
                .ok_or(GovernorError::MissingRateLimitField("tokenLimit"))?,
            tokens_remaining: self
                .tokens_remaining
                .ok_or(GovernorError::MissingRateLimitField("tokensRemaining"))?,
            requests_limit: self
                .requests_limit
                .ok_or(GovernorError::MissingRateLimitField("requestsLimit"))?,
            requests_remaining: self
                .requests_remaining
                .ok_or(GovernorError::MissingRateLimitField("requestsRemaining"))?,
            reset_tokens_in: self
                .reset_tokens_in
                .ok_or(GovernorError::MissingRateLimitField("resetTokensIn"))?,
            reset_requests_in: self
                .reset_requests_in
                .ok_or(GovernorError::MissingRateLimitField("resetRequestsIn"))?,
        })
    }
}

impl From<RateLimitInfo> for RateLimitHeaders {
    fn from(info: RateLimitInfo) -> Self {
        Self {
            token_limit: Some(info.token_limit),
            tokens_remaining: Some(info.tokens_remaining),
            requests_limit: Some(info.requests_limit),
            requests_remaining: Some(info.requests_remaining),
            reset_tokens_in: Some(info.reset_tokens_in),
            reset_requests_in: Some(info.reset_requests_in),
        }
    }
}

fn duration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").expect("duration pattern is valid")
    })
}

/// Parse a reset duration such as `1s`, `6m0s`, `1h2m3.5s` or `250ms`.
///
/// A bare number is read as seconds. Returns `None` for anything else,
/// including values too large for a [`Duration`].
pub fn parse_reset_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).ok();
    }

    let mut total = 0.0_f64;
    let mut consumed = 0;
    for captures in duration_pattern().captures_iter(value) {
        let whole = captures.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let amount: f64 = captures[1].parse().ok()?;
        total += match &captures[2] {
            "h" => amount * 3600.0,
            "m" => amount * 60.0,
            "s" => amount,
            "ms" => amount / 1000.0,
            _ => return None,
        };
    }

    if consumed != value.len() {
        return None;
    }
    Duration::try_from_secs_f64(total).ok()
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn header_duration(headers: &HeaderMap, name: &str) -> Option<Duration> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_reset_duration)
}
