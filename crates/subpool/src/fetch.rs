//! Concurrent retrieval and classification of remote subscription sources
//!
//! All sources of a request are fetched concurrently under one shared timer.
//! When the timer fires every fetch still in flight is dropped; fetches that
//! already finished keep their result. Each source yields exactly one
//! [`SourceResult`], in input order, whatever happened to the others.

use futures::FutureExt;
use futures::future::join_all;
use reqwest::header::USER_AGENT;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::codec::{decode_base64, is_valid_base64};
use crate::config::FetchConfig;
use crate::error::{Result, SubpoolError};

/// Why a single source produced no usable content
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Source points back at this service
    #[error("Recursive source: host matches the serving host")]
    RecursiveSource,

    /// Source is not a usable http(s) URL
    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),

    /// Source answered with a non-success status
    #[error("Source returned HTTP {0}")]
    Status(u16),

    /// Shared fetch deadline elapsed first
    #[error("Timed out waiting for source")]
    Timeout,

    /// Connection or body read failure
    #[error("Network error: {0}")]
    Network(String),

    /// Body is neither a client config, base64, nor a URI list
    #[error("Unrecognized content")]
    UnrecognizedContent,
}

/// Classified result of one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Full client configuration; delegated to the backend by URL
    Convertible(String),
    /// Newline-delimited node URIs (already decoded)
    PlainNodes(String),
    /// Source skipped, failed, or produced nothing usable
    Error(FetchError),
}

/// One source URL and what came of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceResult {
    pub url: String,
    pub outcome: FetchOutcome,
}

/// Request-scoped facts the fetcher needs
#[derive(Debug, Clone, Default)]
pub struct FetchContext<'a> {
    /// Hostname this service is being reached at, for loop detection
    pub serving_host: Option<&'a str>,
    /// Inbound client User-Agent, relayed to sources
    pub client_user_agent: Option<&'a str>,
}

/// Classify a fetched body.
///
/// Priority: client configuration, then base64, then plaintext URI list.
pub fn classify(url: &str, body: &str) -> FetchOutcome {
    if body.contains("proxies:") || (body.contains("outbounds") && body.contains("inbounds")) {
        return FetchOutcome::Convertible(url.to_string());
    }
    if is_valid_base64(body) {
        if let Some(decoded) = decode_base64(body) {
            return FetchOutcome::PlainNodes(normalize_newlines(&decoded));
        }
    }
    if body.contains("://") {
        return FetchOutcome::PlainNodes(normalize_newlines(body));
    }
    FetchOutcome::Error(FetchError::UnrecognizedContent)
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Lowercased host of `host_header`, without any port
pub fn hostname_of(host_header: &str) -> String {
    let host = host_header.trim();
    let without_port = if host.starts_with('[') {
        host.split_once(']')
            .map(|(h, _)| format!("{h}]"))
            .unwrap_or_else(|| host.to_string())
    } else {
        host.split(':').next().unwrap_or(host).to_string()
    };
    without_port.to_ascii_lowercase()
}

/// Fetches remote sources for one request at a time
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
    user_agent: String,
    timeout: Duration,
}

impl SourceFetcher {
    /// Build a fetcher with its own HTTP client
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SubpoolError::Fetch(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, config))
    }

    /// Build a fetcher around an existing client
    pub fn with_client(client: reqwest::Client, config: &FetchConfig) -> Self {
        Self {
            client,
            user_agent: config.user_agent.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// The shared deadline applied to each fan-out
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch and classify every URL concurrently.
    ///
    /// Returns one result per input URL, in input order.
    pub async fn fetch_all(&self, urls: &[String], ctx: &FetchContext<'_>) -> Vec<SourceResult> {
        if urls.is_empty() {
            return Vec::new();
        }

        let user_agent = format!(
            "{} ({})",
            self.user_agent,
            ctx.client_user_agent.filter(|ua| !ua.is_empty()).unwrap_or("N/A")
        );
        let serving_host = ctx.serving_host.map(hostname_of);

        // One timer for the whole fan-out; every task races a clone of it.
        let deadline = tokio::time::sleep(self.timeout).boxed().shared();

        let tasks = urls.iter().map(|url| {
            let deadline = deadline.clone();
            let user_agent = user_agent.as_str();
            let serving_host = serving_host.as_deref();
            async move {
                let outcome = match check_source(url, serving_host) {
                    Err(e) => FetchOutcome::Error(e),
                    Ok(target) => {
                        tokio::select! {
                            biased;
                            fetched = self.fetch_one(target, user_agent) => match fetched {
                                Ok(body) => classify(url, &body),
                                Err(e) => FetchOutcome::Error(e),
                            },
                            _ = deadline => FetchOutcome::Error(FetchError::Timeout),
                        }
                    }
                };
                log_outcome(url, &outcome);
                SourceResult {
                    url: url.clone(),
                    outcome,
                }
            }
        });

        join_all(tasks).await
    }

    async fn fetch_one(&self, target: Url, user_agent: &str) -> std::result::Result<String, FetchError> {
        let response = self
            .client
            .get(target)
            .header(USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::Network(format!("Failed to read body: {e}")))
    }
}

/// Validate a source URL before dispatch
fn check_source(url: &str, serving_host: Option<&str>) -> std::result::Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(FetchError::InvalidUrl(format!(
            "{url}: unsupported scheme '{}'",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| FetchError::InvalidUrl(format!("{url}: missing host")))?
        .to_ascii_lowercase();
    if serving_host.is_some_and(|serving| serving == host) {
        return Err(FetchError::RecursiveSource);
    }
    Ok(parsed)
}

fn log_outcome(url: &str, outcome: &FetchOutcome) {
    match outcome {
        FetchOutcome::Convertible(_) => {
            tracing::debug!(url = %url, "Source is a client config, delegating to converter");
        }
        FetchOutcome::PlainNodes(text) => {
            tracing::debug!(url = %url, lines = text.lines().count(), "Fetched plain nodes");
        }
        FetchOutcome::Error(FetchError::UnrecognizedContent) => {
            tracing::warn!(url = %url, "Unrecognized content from source");
        }
        FetchOutcome::Error(e) => {
            tracing::error!(url = %url, error = %e, "Failed to fetch source");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_clash_config() {
        let body = "port: 7890\nproxies:\n  - name: a\n";
        assert_eq!(
            classify("https://x/sub", body),
            FetchOutcome::Convertible("https://x/sub".to_string())
        );
    }

    #[test]
    fn test_classify_singbox_config_needs_both_keys() {
        let body = r#"{"inbounds": [], "outbounds": []}"#;
        assert!(matches!(classify("u", body), FetchOutcome::Convertible(_)));

        let only_outbounds = r#"{"outbounds": [{"server": "vless://a"}]}"#;
        assert!(matches!(classify("u", only_outbounds), FetchOutcome::PlainNodes(_)));
    }

    #[test]
    fn test_classify_base64() {
        let body = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            "vless://B#node2\r\nvless://A#node1",
        );
        assert_eq!(
            classify("u", &body),
            FetchOutcome::PlainNodes("vless://B#node2\nvless://A#node1".to_string())
        );
    }

    #[test]
    fn test_classify_plaintext() {
        assert_eq!(
            classify("u", "ss://a#x\nss://b#y"),
            FetchOutcome::PlainNodes("ss://a#x\nss://b#y".to_string())
        );
    }

    #[test]
    fn test_classify_unrecognized_and_empty() {
        assert_eq!(
            classify("u", "<html>hello</html>"),
            FetchOutcome::Error(FetchError::UnrecognizedContent)
        );
        assert_eq!(classify("u", ""), FetchOutcome::Error(FetchError::UnrecognizedContent));
    }

    #[test]
    fn test_hostname_of_strips_port_and_case() {
        assert_eq!(hostname_of("Sub.Example.com:8443"), "sub.example.com");
        assert_eq!(hostname_of("sub.example.com"), "sub.example.com");
        assert_eq!(hostname_of("[::1]:8080"), "[::1]");
    }

    #[test]
    fn test_check_source() {
        assert_eq!(
            check_source("https://SUB.example.com/x", Some("sub.example.com")),
            Err(FetchError::RecursiveSource)
        );
        assert!(check_source("https://up.example.com/x", Some("sub.example.com")).is_ok());
        assert!(check_source("https://up.example.com/x", None).is_ok());
        assert!(matches!(
            check_source("not a url", None),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            check_source("ftp://up.example.com/x", None),
            Err(FetchError::InvalidUrl(_))
        ));
    }
}
