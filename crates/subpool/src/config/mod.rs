use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, SubpoolError};
use crate::group::GroupRecord;

/// Main configuration structure for Subpool
///
/// Built once at startup as defaults overlaid by the stored TOML file and then
/// by environment variables. Immutable afterwards.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Remote source fetching configuration
    #[serde(default)]
    pub fetch: FetchConfig,
    /// External conversion backend configuration
    #[serde(default)]
    pub converter: ConverterConfig,
    /// Values surfaced to clients in subscription headers
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    /// Tenant groups
    #[serde(default)]
    pub groups: Vec<GroupRecord>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8787")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Public origin used for the self-callback URL (e.g., "https://sub.example.com")
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Redirect target for requests that match no group
    #[serde(default)]
    pub redirect_url: Option<String>,
    /// Header carrying the client's ISO country code
    #[serde(default = "default_country_header")]
    pub country_header: String,
    /// Refuse requests that score as bots
    #[serde(default = "default_block_bots")]
    pub block_bots: bool,
    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            public_base_url: None,
            redirect_url: None,
            country_header: default_country_header(),
            block_bots: default_block_bots(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_country_header() -> String {
    "cf-ipcountry".to_string()
}

fn default_block_bots() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Remote source fetching configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Shared deadline for the whole fan-out, in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
    /// Product token sent ahead of the relayed client User-Agent
    #[serde(default = "default_fetch_user_agent")]
    pub user_agent: String,
    /// Sources appended to every group's own sources
    #[serde(default)]
    pub extra_sources: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_fetch_timeout_ms(),
            user_agent: default_fetch_user_agent(),
            extra_sources: Vec::new(),
        }
    }
}

fn default_fetch_timeout_ms() -> u64 {
    3000
}

fn default_fetch_user_agent() -> String {
    "v2rayN/6.45".to_string()
}

/// External conversion backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConverterConfig {
    /// Backend host, optionally prefixed with a scheme (e.g., "subapi.example.com")
    #[serde(default)]
    pub address: String,
    /// Scheme used when `address` carries none
    #[serde(default = "default_converter_protocol")]
    pub protocol: String,
    /// Ruleset URL passed as the `config` parameter
    #[serde(default = "default_converter_config_url")]
    pub config_url: String,
    /// Backend request timeout in seconds
    #[serde(default = "default_converter_timeout_secs")]
    pub timeout_secs: u64,
    /// Statically configured candidate URLs appended after fetched configs
    #[serde(default)]
    pub extra_urls: Vec<String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            protocol: default_converter_protocol(),
            config_url: default_converter_config_url(),
            timeout_secs: default_converter_timeout_secs(),
            extra_urls: Vec::new(),
        }
    }
}

impl ConverterConfig {
    /// Resolve the backend as `(protocol, host)`.
    ///
    /// Returns `None` when no address is configured.
    pub fn endpoint(&self) -> Option<(String, String)> {
        let address = self.address.trim().trim_end_matches('/');
        if address.is_empty() {
            return None;
        }
        match address.split_once("://") {
            Some((scheme, host)) if !host.is_empty() => {
                Some((scheme.to_ascii_lowercase(), host.to_string()))
            }
            Some(_) => None,
            None => Some((self.protocol.clone(), address.to_string())),
        }
    }
}

fn default_converter_protocol() -> String {
    "https".to_string()
}

fn default_converter_config_url() -> String {
    "https://raw.githubusercontent.com/cmliu/ACL4SSR/main/Clash/config/ACL4SSR_Online_MultiCountry.ini"
        .to_string()
}

fn default_converter_timeout_secs() -> u64 {
    10
}

/// Values surfaced to clients in subscription headers
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    /// File name offered in the attachment disposition
    #[serde(default = "default_file_name")]
    pub file_name: String,
    /// Client refresh interval in hours
    #[serde(default = "default_update_interval_hours")]
    pub update_interval_hours: u32,
    /// Advertised capacity in TiB
    #[serde(default = "default_total_tb")]
    pub total_tb: u64,
    /// Advertised expiry date ("0" disables expiry)
    #[serde(default = "default_expire_date")]
    pub expire_date: String,
    /// Attach a content disposition to converted responses
    #[serde(default = "default_attachment")]
    pub attachment: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            file_name: default_file_name(),
            update_interval_hours: default_update_interval_hours(),
            total_tb: default_total_tb(),
            expire_date: default_expire_date(),
            attachment: default_attachment(),
        }
    }
}

fn default_file_name() -> String {
    "subpool".to_string()
}

fn default_update_interval_hours() -> u32 {
    4
}

fn default_total_tb() -> u64 {
    99
}

fn default_expire_date() -> String {
    "2099-12-31".to_string()
}

fn default_attachment() -> bool {
    true
}

impl Config {
    /// Parse a stored TOML document. Missing fields fall back to defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SubpoolError::Config(format!("Failed to parse config: {e}")))
    }

    /// Read and parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SubpoolError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Overlay process environment variables on top of this config
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay values from `lookup` on top of this config.
    ///
    /// Recognised keys: `SUBAPI`, `SUBCONFIG`, `SUBNAME`, `SUBUPTIME`,
    /// `LINKSUB`, `WARP`, `URL302`, and per group `<ID>_TOKEN` / `<ID>_DATA`.
    /// Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(address) = get("SUBAPI") {
            self.converter.address = address.trim().to_string();
        }
        if let Some(config_url) = get("SUBCONFIG") {
            self.converter.config_url = config_url.trim().to_string();
        }
        if let Some(file_name) = get("SUBNAME") {
            self.subscription.file_name = file_name.trim().to_string();
        }
        if let Some(hours) = get("SUBUPTIME") {
            match hours.trim().parse() {
                Ok(hours) => self.subscription.update_interval_hours = hours,
                Err(e) => tracing::warn!(value = %hours, error = %e, "Ignoring invalid SUBUPTIME"),
            }
        }
        if let Some(sources) = get("LINKSUB") {
            self.fetch.extra_sources = split_lines(&sources);
        }
        if let Some(urls) = get("WARP") {
            self.converter.extra_urls = split_lines(&urls);
        }
        if let Some(redirect) = get("URL302") {
            self.server.redirect_url = Some(redirect.trim().to_string());
        }

        for group in &mut self.groups {
            let prefix = group.id.to_ascii_uppercase();
            if let Some(token) = get(&format!("{prefix}_TOKEN")) {
                group.token = token.trim().to_string();
            }
            if let Some(data) = get(&format!("{prefix}_DATA")) {
                group.sources = split_lines(&data);
            }
        }
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut tokens = std::collections::HashSet::new();
        for group in &self.groups {
            if group.token.trim().is_empty() {
                return Err(SubpoolError::Config(format!(
                    "Group '{}' has an empty token",
                    group.id
                )));
            }
            if !tokens.insert(group.token.as_str()) {
                return Err(SubpoolError::Config(format!(
                    "Group '{}' shares its token with another group",
                    group.id
                )));
            }
        }
        if self.fetch.timeout_ms == 0 {
            return Err(SubpoolError::Config(
                "fetch.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read access to the effective configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// The configuration to serve the next request with
    async fn load(&self) -> Result<Arc<Config>>;
}

/// Config store holding the configuration resolved at startup
#[derive(Debug, Clone, Default)]
pub struct StaticConfigStore {
    config: Arc<Config>,
}

impl StaticConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn load(&self) -> Result<Arc<Config>> {
        Ok(self.config.clone())
    }
}

/// Split a newline-delimited value into trimmed, non-empty lines
pub fn split_lines(value: &str) -> Vec<String> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
