//! Output format negotiation
//!
//! Query selectors win over the User-Agent. Both tables are consulted in a
//! fixed order so that requests carrying several signals resolve the same way
//! every time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Target format of a subscription response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Clash,
    Singbox,
    Surge,
    Quanx,
    Loon,
    Base64,
}

impl OutputFormat {
    /// The backend's `target` parameter value
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Clash => "clash",
            OutputFormat::Singbox => "singbox",
            OutputFormat::Surge => "surge",
            OutputFormat::Quanx => "quanx",
            OutputFormat::Loon => "loon",
            OutputFormat::Base64 => "base64",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A query selector: a bare parameter name, or a name with a required value
#[derive(Debug, Clone, Copy)]
struct QuerySelector {
    name: &'static str,
    value: Option<&'static str>,
}

const fn flag(name: &'static str) -> QuerySelector {
    QuerySelector { name, value: None }
}

const QUERY_SELECTORS: &[(QuerySelector, OutputFormat)] = &[
    (flag("clash"), OutputFormat::Clash),
    (flag("sb"), OutputFormat::Singbox),
    (flag("singbox"), OutputFormat::Singbox),
    (flag("surge"), OutputFormat::Surge),
    (flag("quanx"), OutputFormat::Quanx),
    (flag("loon"), OutputFormat::Loon),
    (flag("b64"), OutputFormat::Base64),
    (flag("base64"), OutputFormat::Base64),
    (
        QuerySelector {
            name: "format",
            value: Some("base64"),
        },
        OutputFormat::Base64,
    ),
];

/// Lowercase User-Agent fragments
const USER_AGENT_SELECTORS: &[(&str, OutputFormat)] = &[
    ("clash", OutputFormat::Clash),
    ("sing-box", OutputFormat::Singbox),
    ("singbox", OutputFormat::Singbox),
    ("surge", OutputFormat::Surge),
    ("quantumult%20x", OutputFormat::Quanx),
    ("quantumult x", OutputFormat::Quanx),
    ("loon", OutputFormat::Loon),
];

/// Picks the output format for a request
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatNegotiator;

impl FormatNegotiator {
    /// Decide the format from decoded query pairs and the User-Agent.
    ///
    /// Defaults to [`OutputFormat::Base64`].
    pub fn determine(query: &[(String, String)], user_agent: &str) -> OutputFormat {
        for (selector, format) in QUERY_SELECTORS {
            let hit = query.iter().any(|(name, value)| {
                name == selector.name && selector.value.is_none_or(|wanted| value == wanted)
            });
            if hit {
                return *format;
            }
        }

        let user_agent = user_agent.to_lowercase();
        USER_AGENT_SELECTORS
            .iter()
            .find(|(fragment, _)| user_agent.contains(fragment))
            .map(|(_, format)| *format)
            .unwrap_or(OutputFormat::Base64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_is_base64() {
        assert_eq!(FormatNegotiator::determine(&[], ""), OutputFormat::Base64);
        assert_eq!(
            FormatNegotiator::determine(&query(&[("token", "x")]), "Mozilla/5.0"),
            OutputFormat::Base64
        );
    }

    #[test]
    fn test_query_selectors() {
        let cases = [
            ("clash", "", OutputFormat::Clash),
            ("sb", "", OutputFormat::Singbox),
            ("singbox", "1", OutputFormat::Singbox),
            ("surge", "", OutputFormat::Surge),
            ("quanx", "", OutputFormat::Quanx),
            ("loon", "", OutputFormat::Loon),
            ("b64", "", OutputFormat::Base64),
            ("base64", "", OutputFormat::Base64),
            ("format", "base64", OutputFormat::Base64),
        ];
        for (name, value, expected) in cases {
            assert_eq!(
                FormatNegotiator::determine(&query(&[(name, value)]), ""),
                expected,
                "selector {name}={value}"
            );
        }
    }

    #[test]
    fn test_format_selector_requires_value() {
        assert_eq!(
            FormatNegotiator::determine(&query(&[("format", "clash")]), ""),
            OutputFormat::Base64
        );
    }

    #[test]
    fn test_query_overrides_user_agent() {
        assert_eq!(
            FormatNegotiator::determine(&query(&[("b64", "")]), "ClashforWindows/0.20"),
            OutputFormat::Base64
        );
        assert_eq!(
            FormatNegotiator::determine(&query(&[("surge", "")]), "sing-box 1.8"),
            OutputFormat::Surge
        );
    }

    #[test]
    fn test_query_table_order_is_fixed() {
        // parameter order in the request does not matter
        assert_eq!(
            FormatNegotiator::determine(&query(&[("loon", ""), ("clash", "")]), ""),
            OutputFormat::Clash
        );
    }

    #[test]
    fn test_user_agent_selectors() {
        let cases = [
            ("clash.meta/1.18", OutputFormat::Clash),
            ("SFA/1.8.0 (sing-box 1.8.0)", OutputFormat::Singbox),
            ("Surge iOS/2920", OutputFormat::Surge),
            ("Quantumult%20X/1.4.1", OutputFormat::Quanx),
            ("Loon/3.1.3", OutputFormat::Loon),
            ("v2rayN/6.45", OutputFormat::Base64),
        ];
        for (ua, expected) in cases {
            assert_eq!(FormatNegotiator::determine(&[], ua), expected, "ua {ua}");
        }
    }

    #[test]
    fn test_display_matches_target_parameter() {
        assert_eq!(OutputFormat::Singbox.to_string(), "singbox");
        assert_eq!(OutputFormat::Quanx.as_str(), "quanx");
    }
}
