//! Token resolution and daily callback tokens
//!
//! Every group has a permanent secret token. In addition, each group has a
//! fake token derived from its secret and the current UTC day, handed to the
//! conversion backend so it can call back into this service. An inbound
//! request carrying a fake token is a callback.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

use crate::group::Group;

type HmacSha256 = Hmac<Sha256>;

const SECONDS_PER_DAY: i64 = 86_400;

/// Key for the comparison MAC; secrecy is not required, only a fixed width
const COMPARE_KEY: &[u8] = b"subpool/token-compare";

/// Start of the UTC day containing `now`, as epoch seconds
pub fn day_epoch(now: DateTime<Utc>) -> i64 {
    let ts = now.timestamp();
    ts - ts.rem_euclid(SECONDS_PER_DAY)
}

/// Today's fake token for a group secret: hex HMAC-SHA256 keyed by the secret
/// over the decimal UTC-day epoch
pub fn fake_token(secret: &str, now: DateTime<Utc>) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(day_epoch(now).to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time token equality. Both sides are reduced to fixed-width MAC
/// tags, then compared with `verify_slice`, so neither content nor length
/// shortcuts the comparison.
pub fn tokens_equal(candidate: &str, expected: &str) -> bool {
    let mut expected_mac =
        HmacSha256::new_from_slice(COMPARE_KEY).expect("HMAC can take key of any size");
    expected_mac.update(expected.as_bytes());
    let expected_tag = expected_mac.finalize().into_bytes();

    let mut candidate_mac =
        HmacSha256::new_from_slice(COMPARE_KEY).expect("HMAC can take key of any size");
    candidate_mac.update(candidate.as_bytes());
    candidate_mac.verify_slice(&expected_tag).is_ok()
}

/// A successfully resolved inbound token
#[derive(Debug, Clone)]
pub struct Resolution {
    pub group: Arc<Group>,
    /// The token was today's fake token rather than the permanent one
    pub is_callback: bool,
    /// Today's fake token for the resolved group
    pub fake_token: String,
}

/// Maps inbound tokens to groups
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenResolver;

impl TokenResolver {
    /// Resolve `token` against `groups` for the UTC day containing `now`.
    ///
    /// Permanent tokens are checked before fake tokens. Returns `None` when
    /// nothing matches.
    pub fn resolve(token: &str, groups: &[Arc<Group>], now: DateTime<Utc>) -> Option<Resolution> {
        if token.is_empty() {
            return None;
        }

        let fake_tokens: Vec<String> = groups.iter().map(|g| fake_token(&g.token, now)).collect();

        let permanent = groups
            .iter()
            .zip(&fake_tokens)
            .find(|(group, _)| tokens_equal(token, &group.token));
        if let Some((group, fake)) = permanent {
            return Some(Resolution {
                group: group.clone(),
                is_callback: false,
                fake_token: fake.clone(),
            });
        }

        groups
            .iter()
            .zip(&fake_tokens)
            .find(|(_, fake)| tokens_equal(token, fake))
            .map(|(group, fake)| Resolution {
                group: group.clone(),
                is_callback: true,
                fake_token: fake.clone(),
            })
    }
}
