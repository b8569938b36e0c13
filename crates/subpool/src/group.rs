//! Tenant groups and the store they are read from
//!
//! A group owns a secret token, an ordered list of data sources and a filter.
//! Groups are read-only to the aggregation pipeline; filters are compiled once
//! when a group is loaded into a store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Result, SubpoolError};
use crate::filter::{FilterConfig, FilterEngine};
use crate::token::tokens_equal;

/// A group as stored (TOML `[[groups]]` entries or an external store)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Stable identifier, also used for `<ID>_TOKEN` / `<ID>_DATA` overrides
    pub id: String,
    /// Display name used in logs
    pub name: String,
    /// Secret token granting access to this group
    pub token: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_guest: bool,
    /// Serve requests whose country header says `CN`
    #[serde(default)]
    pub allow_china_access: bool,
    /// Ordered data sources: subscription URLs or opaque proxy URIs
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub filter: FilterConfig,
}

/// A loaded group with its filter compiled
#[derive(Debug, Clone)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub token: String,
    pub is_admin: bool,
    pub is_guest: bool,
    pub allow_china_access: bool,
    pub sources: Vec<String>,
    pub filter: FilterConfig,
    compiled_filter: FilterEngine,
}

impl Group {
    /// Load a stored record, compiling its filter rules
    pub fn from_record(record: GroupRecord) -> Self {
        let compiled_filter = FilterEngine::compile(&record.filter);
        if record.filter.enabled && compiled_filter.rule_count() < record.filter.rules.len() {
            tracing::warn!(
                group = %record.name,
                compiled = compiled_filter.rule_count(),
                configured = record.filter.rules.len(),
                "Some filter rules failed to compile"
            );
        }
        Self {
            id: record.id,
            name: record.name,
            token: record.token,
            is_admin: record.is_admin,
            is_guest: record.is_guest,
            allow_china_access: record.allow_china_access,
            sources: record.sources,
            filter: record.filter,
            compiled_filter,
        }
    }

    /// The compiled filter for this group
    pub fn filter_engine(&self) -> &FilterEngine {
        &self.compiled_filter
    }

    /// Split this group's sources, followed by `extra`, into inline nodes and
    /// subscription URLs
    pub fn partition_sources(&self, extra: &[String]) -> SourceSet {
        SourceSet::partition(self.sources.iter().chain(extra.iter()).map(String::as_str))
    }
}

/// Group sources split by kind, each in first-occurrence order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSet {
    /// Opaque proxy URIs served as-is
    pub inline: Vec<String>,
    /// Remote subscriptions to fetch, de-duplicated
    pub urls: Vec<String>,
}

impl SourceSet {
    /// Partition source strings. Multi-line strings contribute one source per
    /// line; blank lines are dropped. Lines starting with `http://`,
    /// `https://` or `//` are subscription URLs.
    pub fn partition<'a, I>(sources: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut set = SourceSet::default();
        for line in sources.into_iter().flat_map(str::lines) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match subscription_url(line) {
                Some(url) => {
                    if !set.urls.contains(&url) {
                        set.urls.push(url);
                    }
                }
                None => set.inline.push(line.to_string()),
            }
        }
        set
    }
}

fn subscription_url(line: &str) -> Option<String> {
    let lower = line.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Some(line.to_string())
    } else if line.starts_with("//") {
        Some(format!("https:{line}"))
    } else {
        None
    }
}

/// Read access to the groups known to this service
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Look up the group owning `token`
    async fn get(&self, token: &str) -> Result<Option<Arc<Group>>>;

    /// Every known group
    async fn list(&self) -> Result<Vec<Arc<Group>>>;
}

/// Group store backed by the loaded configuration
#[derive(Debug, Clone, Default)]
pub struct StaticGroupStore {
    groups: Vec<Arc<Group>>,
}

impl StaticGroupStore {
    /// Load records, rejecting duplicate tokens
    pub fn new(records: Vec<GroupRecord>) -> Result<Self> {
        let mut groups: Vec<Arc<Group>> = Vec::with_capacity(records.len());
        for record in records {
            if groups.iter().any(|g| g.token == record.token) {
                return Err(SubpoolError::Group(format!(
                    "Duplicate token for group '{}'",
                    record.id
                )));
            }
            groups.push(Arc::new(Group::from_record(record)));
        }
        Ok(Self { groups })
    }
}

#[async_trait]
impl GroupStore for StaticGroupStore {
    /// Every stored token is compared in constant time, with no early exit
    async fn get(&self, token: &str) -> Result<Option<Arc<Group>>> {
        let found = self.groups.iter().fold(None, |found, group| {
            if tokens_equal(token, &group.token) {
                Some(group)
            } else {
                found
            }
        });
        Ok(found.cloned())
    }

    async fn list(&self) -> Result<Vec<Arc<Group>>> {
        Ok(self.groups.clone())
    }
}
