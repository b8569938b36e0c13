//! Per-group line filtering
//!
//! Rules are written either as delimited patterns (`/剩余流量/i`) or as bare
//! patterns (`expire`). Each rule yields two matchers: one for the pattern as
//! written and one for its percent-encoded form, because proxy URI fragments
//! usually carry percent-encoded remark text.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Flags accepted after the closing delimiter
const RULE_FLAGS: &str = "gimsuy";

/// Characters left unescaped in a URI component, so `(`, `)`, `.` and `*`
/// keep their regex meaning in the encoded matcher
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Filter settings as stored on a group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Whether filtering is applied at all
    #[serde(default)]
    pub enabled: bool,
    /// Ordered exclusion rules
    #[serde(default)]
    pub rules: Vec<String>,
}

/// A rule string split into its pattern and flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSpec {
    /// `/pattern/flags`
    Delimited { pattern: String, flags: String },
    /// Anything not in delimited form
    Bare(String),
}

impl RuleSpec {
    /// Parse a rule string.
    ///
    /// The pattern ends at the first `/` whose remainder consists only of
    /// flag characters, so `/a/b/i` yields pattern `a/b` with flag `i`.
    pub fn parse(rule: &str) -> Self {
        if let Some(body) = rule.strip_prefix('/') {
            for (idx, ch) in body.char_indices() {
                if ch != '/' {
                    continue;
                }
                let flags = &body[idx + 1..];
                if flags.chars().all(|f| RULE_FLAGS.contains(f)) {
                    return RuleSpec::Delimited {
                        pattern: body[..idx].to_string(),
                        flags: flags.to_string(),
                    };
                }
            }
        }
        RuleSpec::Bare(rule.to_string())
    }

    fn pattern(&self) -> &str {
        match self {
            RuleSpec::Delimited { pattern, .. } => pattern,
            RuleSpec::Bare(pattern) => pattern,
        }
    }

    fn flags(&self) -> &str {
        match self {
            RuleSpec::Delimited { flags, .. } => flags,
            RuleSpec::Bare(_) => "",
        }
    }
}

/// One rule compiled into its literal and percent-encoded matchers
#[derive(Debug, Clone)]
struct CompiledRule {
    literal: Regex,
    encoded: Option<Regex>,
}

impl CompiledRule {
    fn compile(rule: &str) -> Option<Self> {
        let spec = RuleSpec::parse(rule);
        let flags = spec.flags();

        let literal = match build_regex(spec.pattern(), flags) {
            Ok(regex) => regex,
            Err(e) => match spec {
                RuleSpec::Bare(ref pattern) => {
                    tracing::debug!(rule = %rule, error = %e, "Bare rule is not a valid regex, matching literally");
                    build_regex(&regex::escape(pattern), flags).ok()?
                }
                RuleSpec::Delimited { .. } => {
                    tracing::warn!(rule = %rule, error = %e, "Skipping invalid filter rule");
                    return None;
                }
            },
        };

        let encoded_pattern = utf8_percent_encode(spec.pattern(), URI_COMPONENT).to_string();
        let encoded = if encoded_pattern == spec.pattern() {
            None
        } else {
            match build_regex(&encoded_pattern, flags) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::debug!(rule = %rule, error = %e, "Encoded form of rule does not compile");
                    None
                }
            }
        };

        Some(Self { literal, encoded })
    }

    fn is_match(&self, line: &str) -> bool {
        self.literal.is_match(line)
            || self
                .encoded
                .as_ref()
                .is_some_and(|encoded| encoded.is_match(line))
    }
}

fn build_regex(pattern: &str, flags: &str) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
}

/// A group's filter, compiled once when the group is loaded
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    enabled: bool,
    rules: Vec<CompiledRule>,
}

impl FilterEngine {
    /// Compile every rule of `config`. Invalid rules are logged and skipped.
    pub fn compile(config: &FilterConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .filter_map(|rule| CompiledRule::compile(rule))
            .collect();
        Self {
            enabled: config.enabled,
            rules,
        }
    }

    /// Whether applying this filter can change anything
    pub fn is_active(&self) -> bool {
        self.enabled && !self.rules.is_empty()
    }

    /// Number of rules that compiled successfully
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Whether any rule matches `line`, ignoring whether the filter is enabled
    pub fn matches(&self, line: &str) -> bool {
        self.rules.iter().any(|rule| rule.is_match(line))
    }

    /// Drop every non-blank line matched by a rule, preserving order
    pub fn apply(&self, text: &str) -> String {
        if !self.is_active() {
            return text.to_string();
        }
        text.split('\n')
            .filter(|line| line.trim().is_empty() || !self.matches(line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
