//! Request admission checks applied after a token resolves
//!
//! Two rules: requests from mainland China are refused unless the group opts
//! in, and requests scoring as automated crawlers are refused when bot
//! blocking is enabled. Conversion-backend callbacks skip the bot check.

use axum::http::{HeaderMap, header};

use crate::config::ServerConfig;
use crate::group::Group;

/// Score at or above which a request is treated as a bot
pub const BOT_THRESHOLD: i32 = 50;

/// Case-insensitive User-Agent fragments of crawlers and link previewers
const CRAWLER_PATTERNS: &[&str] = &[
    "bot",
    "spider",
    "crawler",
    "slurp",
    "ia_archiver",
    "sogou",
    "facebook",
    "pinterest",
    "chatgpt-user",
    "qq",
    "micromessenger",
    "request",
    "wget",
];

/// Case-sensitive fragments of browsers and known proxy clients
const KNOWN_CLIENTS: &[&str] = &[
    "Mozilla/5.0",
    "Chrome",
    "Safari",
    "Firefox",
    "Edg",
    "v2rayN",
    "Clash",
    "sing-box",
    "mihomo",
    "xray",
];

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// Country header says `CN` and the group does not allow it
    China,
    /// Header heuristics scored the request as a bot
    Bot { score: i32 },
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Heuristic bot score for a request's headers
pub fn bot_score(headers: &HeaderMap) -> i32 {
    let user_agent = header_str(headers, header::USER_AGENT.as_str());
    let lower = user_agent.to_lowercase();
    let mut score = 0;

    if user_agent.is_empty() {
        score += 30;
    }
    if CRAWLER_PATTERNS.iter().any(|p| lower.contains(p)) {
        score += 50;
    }
    if !KNOWN_CLIENTS.iter().any(|c| user_agent.contains(c)) {
        score += 10;
    }

    let navigation_complete = !header_str(headers, "sec-fetch-site").is_empty()
        && header_str(headers, "sec-fetch-mode") == "navigate"
        && header_str(headers, "sec-fetch-dest") == "document"
        && !header_str(headers, "sec-fetch-user").is_empty();
    if !navigation_complete {
        score += 20;
    }

    let accept = header_str(headers, header::ACCEPT.as_str());
    if !accept.contains("text/html") || accept.len() < 10 {
        score += 10;
    }

    if header_str(headers, "subconverter-request") == "1"
        && !header_str(headers, "subconverter-version").is_empty()
        && user_agent.contains("subconverter")
    {
        score -= 10;
    }

    score
}

/// Admission rules derived from the server configuration
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    country_header: String,
    block_bots: bool,
}

impl AccessPolicy {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            country_header: config.country_header.to_ascii_lowercase(),
            block_bots: config.block_bots,
        }
    }

    /// Decide whether `group` may be served to a request with `headers`
    pub fn check(
        &self,
        headers: &HeaderMap,
        group: &Group,
        is_callback: bool,
    ) -> Result<(), Refusal> {
        let country = header_str(headers, &self.country_header);
        if country.eq_ignore_ascii_case("CN") && !group.allow_china_access {
            return Err(Refusal::China);
        }

        if self.block_bots && !is_callback {
            let score = bot_score(headers);
            if score >= BOT_THRESHOLD {
                return Err(Refusal::Bot { score });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupRecord;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn group(allow_china_access: bool) -> Group {
        Group::from_record(GroupRecord {
            id: "g".to_string(),
            name: "G".to_string(),
            token: "t".to_string(),
            is_admin: false,
            is_guest: false,
            allow_china_access,
            sources: Vec::new(),
            filter: Default::default(),
        })
    }

    fn policy(block_bots: bool) -> AccessPolicy {
        AccessPolicy::new(&ServerConfig {
            block_bots,
            ..ServerConfig::default()
        })
    }

    #[test]
    fn test_proxy_client_scores_low() {
        let h = headers(&[("user-agent", "ClashMeta/1.18")]);
        assert_eq!(bot_score(&h), 30);
    }

    #[test]
    fn test_missing_user_agent() {
        assert_eq!(bot_score(&HeaderMap::new()), 70);
    }

    #[test]
    fn test_crawler_user_agent() {
        let h = headers(&[("user-agent", "Wget/1.21")]);
        assert!(bot_score(&h) >= BOT_THRESHOLD);
        let h = headers(&[("user-agent", "python-requests/2.31")]);
        assert!(bot_score(&h) >= BOT_THRESHOLD);
    }

    #[test]
    fn test_full_browser_navigation() {
        let h = headers(&[
            ("user-agent", "Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0"),
            ("sec-fetch-site", "none"),
            ("sec-fetch-mode", "navigate"),
            ("sec-fetch-dest", "document"),
            ("sec-fetch-user", "?1"),
            ("accept", "text/html,application/xhtml+xml"),
        ]);
        assert_eq!(bot_score(&h), 0);
    }

    #[test]
    fn test_converter_callback_markers_lower_score() {
        let h = headers(&[
            ("user-agent", "subconverter/0.9"),
            ("subconverter-request", "1"),
            ("subconverter-version", "0.9.0"),
        ]);
        assert_eq!(bot_score(&h), 30);
    }

    #[test]
    fn test_china_requires_opt_in() {
        let h = headers(&[("cf-ipcountry", "CN"), ("user-agent", "v2rayN/6.45")]);
        assert_eq!(policy(true).check(&h, &group(false), false), Err(Refusal::China));
        assert_eq!(policy(true).check(&h, &group(true), false), Ok(()));
    }

    #[test]
    fn test_bot_blocking() {
        let h = headers(&[("user-agent", "Googlebot/2.1")]);
        assert!(matches!(
            policy(true).check(&h, &group(false), false),
            Err(Refusal::Bot { .. })
        ));
        assert_eq!(policy(false).check(&h, &group(false), false), Ok(()));
        // callbacks skip the bot check
        assert_eq!(policy(true).check(&h, &group(false), true), Ok(()));
    }
}
