//! Delegation of rich formats to the external conversion backend
//!
//! Base64 output is produced locally. Every other format is produced by the
//! backend from a list of candidate URLs: a callback into this service for the
//! locally aggregated nodes, followed by any client configs found while
//! fetching, followed by statically configured extras. A backend failure never
//! reaches the client; the local base64 payload is served instead.

use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::codec::encode_base64;
use crate::config::ConverterConfig;
use crate::error::{Result, SubpoolError};
use crate::format::OutputFormat;
use crate::response::Payload;

/// Why the backend could not produce a conversion
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// No backend address configured
    #[error("No conversion backend configured")]
    NotConfigured,

    /// Backend address does not form a valid URL
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// Backend answered with something other than 200
    #[error("Conversion backend returned HTTP {0}")]
    Status(u16),

    /// Backend did not answer in time
    #[error("Conversion backend timed out")]
    Timeout,

    /// Connection or body read failure
    #[error("Network error: {0}")]
    Network(String),
}

/// Assemble candidate URLs for the backend, in delegation order.
///
/// The callback URL is left out when there are no aggregated nodes to serve.
pub fn candidate_urls(
    callback_url: &str,
    aggregated: &str,
    convertible_urls: &[String],
    extra_urls: &[String],
) -> Vec<String> {
    let mut candidates = Vec::with_capacity(1 + convertible_urls.len() + extra_urls.len());
    if !aggregated.trim().is_empty() {
        candidates.push(callback_url.to_string());
    }
    candidates.extend(convertible_urls.iter().cloned());
    candidates.extend(extra_urls.iter().cloned());
    candidates
}

/// Add `remote-dns-resolve` to WireGuard proxies of a Clash config.
///
/// This is a plain text substitution on the exact fragment
/// `, mtu: 1280, udp: true` as emitted by the backend. Proxies with any other
/// MTU or key order are left unchanged.
pub fn patch_clash_wireguard(content: &str) -> String {
    if content.contains("type: wireguard") && !content.contains("remote-dns-resolve") {
        content.replace(
            ", mtu: 1280, udp: true",
            ", mtu: 1280, remote-dns-resolve: true, udp: true",
        )
    } else {
        content.to_string()
    }
}

/// Issues conversion requests and falls back to local payloads
#[derive(Debug, Clone)]
pub struct ConversionDelegate {
    client: reqwest::Client,
    config: ConverterConfig,
}

impl ConversionDelegate {
    /// Build a delegate with its own HTTP client
    pub fn new(config: &ConverterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SubpoolError::Conversion(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, config))
    }

    /// Build a delegate around an existing client. The backend timeout is
    /// applied per request from `config`.
    pub fn with_client(client: reqwest::Client, config: &ConverterConfig) -> Self {
        Self {
            client,
            config: config.clone(),
        }
    }

    /// Backend request URL for `format` and `candidates`
    pub fn backend_url(
        &self,
        format: OutputFormat,
        candidates: &[String],
    ) -> std::result::Result<Url, ConversionError> {
        let (protocol, host) = self.config.endpoint().ok_or(ConversionError::NotConfigured)?;
        let mut url = Url::parse(&format!("{protocol}://{host}/sub"))
            .map_err(|e| ConversionError::InvalidUrl(format!("{protocol}://{host}: {e}")))?;

        {
            let mut params = url.query_pairs_mut();
            params
                .append_pair("target", format.as_str())
                .append_pair("url", &candidates.join("|"))
                .append_pair("insert", "false")
                .append_pair("config", &self.config.config_url)
                .append_pair("emoji", "true")
                .append_pair("list", "false")
                .append_pair("tfo", "false")
                .append_pair("scv", "true")
                .append_pair("fdn", "false")
                .append_pair("sort", "false");
            match format {
                OutputFormat::Clash | OutputFormat::Singbox => {
                    params.append_pair("new_name", "true");
                }
                OutputFormat::Surge => {
                    params.append_pair("ver", "4");
                }
                OutputFormat::Quanx => {
                    params.append_pair("udp", "true");
                }
                OutputFormat::Loon | OutputFormat::Base64 => {}
            }
        }

        Ok(url)
    }

    /// Produce the payload for `format`.
    ///
    /// `aggregated` is the filtered, de-duplicated node list; `callback_url`
    /// points the backend back at this service for it.
    pub async fn deliver(
        &self,
        format: OutputFormat,
        aggregated: &str,
        callback_url: &str,
        convertible_urls: &[String],
    ) -> Payload {
        if format == OutputFormat::Base64 {
            return Payload::local(encode_base64(aggregated));
        }

        let candidates = candidate_urls(
            callback_url,
            aggregated,
            convertible_urls,
            &self.config.extra_urls,
        );
        if candidates.is_empty() {
            tracing::debug!(format = %format, "Nothing to convert, serving empty payload");
            return Payload::local(encode_base64(""));
        }

        match self.convert(format, &candidates).await {
            Ok(body) => Payload::converted(body),
            Err(e) => {
                tracing::error!(
                    format = %format,
                    candidates = candidates.len(),
                    error = %e,
                    "Conversion backend failed, serving local base64"
                );
                Payload::local(encode_base64(aggregated))
            }
        }
    }

    async fn convert(
        &self,
        format: OutputFormat,
        candidates: &[String],
    ) -> std::result::Result<String, ConversionError> {
        let url = self.backend_url(format, candidates)?;
        tracing::debug!(format = %format, "Requesting conversion");

        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConversionError::Timeout
                } else {
                    ConversionError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ConversionError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ConversionError::Timeout
            } else {
                ConversionError::Network(format!("Failed to read body: {e}"))
            }
        })?;

        Ok(match format {
            OutputFormat::Clash => patch_clash_wireguard(&body),
            _ => body,
        })
    }
}
