//! Page downloads, gated per web origin.
//!
//! Each origin (`scheme://host[:port]`) is its own gate resource, so a crawl
//! touches any one site near-serially while different sites proceed in
//! parallel.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use reqwest::header::ACCEPT;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::GovernorError;
use crate::governor::ConcurrencyGate;

/// Errors from fetching a page.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    Status { url: String, status: StatusCode },

    #[error(transparent)]
    Gate(#[from] GovernorError),
}

/// A downloaded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: Url,
    pub status: u16,
    pub html: String,
}

impl FetchedPage {
    /// Visible text with tags, scripts and styles removed and whitespace
    /// collapsed.
    pub fn text(&self) -> String {
        html_to_text(&self.html)
    }

    /// Absolute targets of every `href` on the page, in document order.
    pub fn links(&self) -> Vec<Url> {
        href_regex()
            .captures_iter(&self.html)
            .filter_map(|caps| caps.get(1))
            .filter_map(|href| self.url.join(&decode_entities(href.as_str())).ok())
            .collect()
    }
}

/// HTTP client that holds an origin's gate slot for the duration of a fetch.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
    gate: Arc<ConcurrencyGate>,
}

impl PageFetcher {
    pub fn new(gate: Arc<ConcurrencyGate>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, gate })
    }

    /// Use a preconfigured client.
    pub fn with_client(client: reqwest::Client, gate: Arc<ConcurrencyGate>) -> Self {
        Self { client, gate }
    }

    /// Download `url` as HTML. Non-success statuses are errors.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let parsed = Url::parse(url).map_err(|err| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let origin = origin_key(&parsed).ok_or_else(|| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: "url has no host".to_string(),
        })?;

        let _permit = self.gate.acquire(&origin).await?;
        debug!(url, origin = %origin, "fetching page");

        let request_error = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };
        let response = self
            .client
            .get(parsed)
            .header(ACCEPT, "text/html")
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        let final_url = response.url().clone();
        let html = response.text().await.map_err(request_error)?;
        info!(url = %final_url, bytes = html.len(), "fetched page");

        Ok(FetchedPage {
            url: final_url,
            status: status.as_u16(),
            html,
        })
    }
}

/// Gate key for a URL: `scheme://host`, plus `:port` when one is explicit.
pub fn origin_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

fn href_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']+)["']"#).expect("valid href regex")
    })
}

fn html_to_text(html: &str) -> String {
    static HIDDEN: OnceLock<Regex> = OnceLock::new();
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static SPACE: OnceLock<Regex> = OnceLock::new();

    let hidden = HIDDEN.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript)\b.*?</(script|style|noscript)\s*>|<!--.*?-->")
            .expect("valid hidden-content regex")
    });
    let tags = TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
    let space = SPACE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"));

    let visible = hidden.replace_all(html, " ");
    let stripped = tags.replace_all(&visible, " ");
    let decoded = decode_entities(&stripped);
    space.replace_all(&decoded, " ").trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
