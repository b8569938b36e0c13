//! Per-request subscription generation
//!
//! A straight line from a resolved group to a payload: partition sources,
//! fetch remote ones concurrently, merge with inline nodes, pick a format and
//! either encode locally or hand off to the conversion backend. Nothing here
//! fails; the worst outcome is an empty or partial base64 payload.

use crate::aggregate::{Aggregator, FetchReport};
use crate::config::Config;
use crate::convert::ConversionDelegate;
use crate::error::{Result, SubpoolError};
use crate::fetch::{FetchContext, SourceFetcher};
use crate::format::{FormatNegotiator, OutputFormat};
use crate::response::Payload;
use crate::token::Resolution;

/// Request facts the pipeline needs, already extracted from HTTP
#[derive(Debug, Clone, Default)]
pub struct RequestContext<'a> {
    /// Decoded query pairs in request order
    pub query: &'a [(String, String)],
    /// Inbound User-Agent, empty when absent
    pub user_agent: &'a str,
    /// Hostname the request was addressed to
    pub serving_host: Option<&'a str>,
    /// Public origin of this service, without trailing slash
    pub origin: &'a str,
}

/// Self-callback URL the backend uses to pull locally aggregated nodes
pub fn callback_url(origin: &str, fake_token: &str) -> String {
    format!(
        "{}/sub?token={}&format=base64",
        origin.trim_end_matches('/'),
        urlencoding::encode(fake_token)
    )
}

/// Turns a resolved group into a subscription payload.
///
/// Only the HTTP client outlives a request; timeouts, User-Agent, extra
/// sources and the backend are read from the config passed to
/// [`SubscriptionPipeline::generate`].
#[derive(Debug, Clone)]
pub struct SubscriptionPipeline {
    client: reqwest::Client,
}

impl SubscriptionPipeline {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SubpoolError::General(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Format a request resolves to. Callbacks always get base64 so the
    /// backend never triggers another conversion.
    pub fn negotiate(resolution: &Resolution, ctx: &RequestContext<'_>) -> OutputFormat {
        if resolution.is_callback {
            OutputFormat::Base64
        } else {
            FormatNegotiator::determine(ctx.query, ctx.user_agent)
        }
    }

    /// Run the whole pipeline for one request under `config`
    pub async fn generate(
        &self,
        config: &Config,
        resolution: &Resolution,
        ctx: &RequestContext<'_>,
    ) -> Payload {
        let fetcher = SourceFetcher::with_client(self.client.clone(), &config.fetch);
        let converter = ConversionDelegate::with_client(self.client.clone(), &config.converter);

        let group = &resolution.group;
        let filter = group.filter_engine();
        let sources = group.partition_sources(&config.fetch.extra_sources);

        let fetch_ctx = FetchContext {
            serving_host: ctx.serving_host,
            client_user_agent: Some(ctx.user_agent),
        };
        let results = fetcher.fetch_all(&sources.urls, &fetch_ctx).await;
        let report = FetchReport::from_results(results, filter);

        let aggregated = Aggregator::combine(&sources.inline, &report.plain_nodes, filter);
        let format = Self::negotiate(resolution, ctx);

        tracing::info!(
            group = %group.name,
            format = %format,
            callback = resolution.is_callback,
            inline = sources.inline.len(),
            fetched = report.plain_nodes.len(),
            convertible = report.convertible_urls.len(),
            failed = report.failed,
            "Generating subscription"
        );

        let callback = callback_url(ctx.origin, &resolution.fake_token);
        converter
            .deliver(format, &aggregated, &callback, &report.convertible_urls)
            .await
    }
}
