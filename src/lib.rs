//! Crawl webpages and summarise them through a rate-limited text-generation
//! service.
//!
//! The heart of the crate is [`governor::RequestGovernor`], which wraps a
//! [`governor::Transport`] with a durable response cache, single-flight
//! deduplication, per-resource concurrency limits and a rolling-window token
//! budget that adapts to the limits the server reports.
//!
//! Around it:
//! - [`client`]: an OpenAI-compatible chat-completions transport
//! - [`fetch`]: page downloads gated per web origin
//! - [`text`]: chunking page text for summarisation
//! - [`config`]: TOML and environment configuration

pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod governor;
pub mod logging;
pub mod metrics;
pub mod text;

pub use crate::config::GovernorConfig;
pub use error::{ConfigError, GovernorError, GovernorResult};
pub use governor::{Completion, Payload, RequestGovernor};
