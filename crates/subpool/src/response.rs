//! Subscription response framing
//!
//! Clients expect a handful of headers next to the body: refresh interval,
//! a usage line, and for converted configs a file name. The usage figures are
//! synthesized from configuration; nothing here counts real traffic.

use axum::{
    body::Body,
    http::{HeaderValue, Response, StatusCode, header},
};
use chrono::{DateTime, NaiveDate, Utc};

use crate::config::SubscriptionConfig;

/// Bytes in one TiB
pub const BYTES_PER_TB: u64 = 1_099_511_627_776;

/// Expiry sentinel for dates that cannot be parsed
pub const EXPIRE_UNPARSABLE: i64 = -1;

pub const PROFILE_UPDATE_INTERVAL: &str = "profile-update-interval";
pub const SUBSCRIPTION_USERINFO: &str = "subscription-userinfo";

/// A finished subscription body and how it was produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub body: String,
    /// Produced by the conversion backend rather than encoded locally
    pub converted: bool,
}

impl Payload {
    pub fn local(body: String) -> Self {
        Self {
            body,
            converted: false,
        }
    }

    pub fn converted(body: String) -> Self {
        Self {
            body,
            converted: true,
        }
    }
}

/// Parse the configured expiry into epoch seconds.
///
/// `"0"` means no expiry and yields `0`. Accepts `YYYY-MM-DD` (midnight UTC)
/// or RFC 3339; anything else yields [`EXPIRE_UNPARSABLE`].
pub fn expire_epoch(expire_date: &str) -> i64 {
    let value = expire_date.trim();
    if value == "0" {
        return 0;
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(EXPIRE_UNPARSABLE);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp())
        .unwrap_or(EXPIRE_UNPARSABLE)
}

/// Build the `subscription-userinfo` value.
///
/// Upload and download report half of the capacity scaled by the share of
/// time remaining until expiry, so clients show a plausible gauge.
///
/// The share is remaining time over the whole span from the Unix epoch to
/// expiry, not over a billing period, so it barely moves for a far-off expiry.
pub fn usage_header(config: &SubscriptionConfig, now: DateTime<Utc>) -> String {
    let total = config.total_tb.saturating_mul(BYTES_PER_TB);
    let expire = expire_epoch(&config.expire_date);

    let used = if expire > 0 {
        let expire_ms = expire as f64 * 1000.0;
        let remaining_ms = expire_ms - now.timestamp_millis() as f64;
        let share = (remaining_ms / expire_ms).clamp(0.0, 1.0);
        ((share * total as f64) / 2.0).floor() as u64
    } else {
        0
    };

    format!("upload={used}; download={used}; total={total}; expire={expire}")
}

/// Frames payloads into HTTP responses
#[derive(Debug, Clone)]
pub struct ResponseComposer<'a> {
    config: &'a SubscriptionConfig,
}

impl<'a> ResponseComposer<'a> {
    pub fn new(config: &'a SubscriptionConfig) -> Self {
        Self { config }
    }

    /// `attachment` disposition with the configured file name, RFC 5987 encoded
    pub fn content_disposition(&self) -> String {
        format!(
            "attachment; filename*=utf-8''{}",
            urlencoding::encode(&self.config.file_name)
        )
    }

    /// Build the response for `payload` as of `now`
    pub fn compose(&self, payload: Payload, now: DateTime<Utc>) -> Response<Body> {
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(
                PROFILE_UPDATE_INTERVAL,
                self.config.update_interval_hours.to_string(),
            )
            .header(SUBSCRIPTION_USERINFO, usage_header(self.config, now));

        if payload.converted && self.config.attachment {
            if let Ok(value) = HeaderValue::from_str(&self.content_disposition()) {
                builder = builder.header(header::CONTENT_DISPOSITION, value);
            }
        }

        builder.body(Body::from(payload.body)).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build subscription response");
            let mut fallback = Response::new(Body::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
    }
}
