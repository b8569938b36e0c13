//! Base64 helpers for subscription payloads
//!
//! Subscription bodies arrive in either the standard or the URL-safe
//! alphabet, padded or not, sometimes wrapped across lines. Outgoing payloads
//! are always standard, padded base64 of the UTF-8 text.

use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig, general_purpose::STANDARD},
};

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Whether `body` looks like a base64 payload.
///
/// Whitespace is ignored. The rest must be non-empty, a multiple of four
/// long, drawn from `[A-Za-z0-9+/_-]` and end in at most two `=`.
pub fn is_valid_base64(body: &str) -> bool {
    let clean: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    if clean.is_empty() || clean.len() % 4 != 0 {
        return false;
    }
    let data = clean.trim_end_matches('=');
    if clean.len() - data.len() > 2 || data.is_empty() {
        return false;
    }
    data.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '_' | '-'))
}

/// Decode a payload accepted by [`is_valid_base64`] into text.
///
/// Invalid UTF-8 sequences are replaced rather than rejected.
pub fn decode_base64(body: &str) -> Option<String> {
    let normalized: String = body
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    let bytes = LENIENT.decode(normalized.as_bytes()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Encode text as standard padded base64 of its UTF-8 bytes
pub fn encode_base64(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}
