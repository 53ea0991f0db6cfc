//! Offline inspection of access tokens.
//!
//! Access tokens are three-part signed tokens (`header.payload.signature`).
//! The payload is base64url JSON that may carry an `exp` claim in seconds
//! since the epoch. It is mapped onto the standard alphabet before decoding,
//! so payloads written with either alphabet are accepted. Nothing here verifies signatures: the server remains the
//! authority on validity, the client only wants to know when to renew.
//!
//! Every function in this module is total. Malformed input yields `None`
//! (or `false`), so an unreadable token is treated as "expiry unknown" and
//! never forces a renewal on its own.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

/// Standard alphabet that accepts payloads with or without trailing `=`.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode the payload claims of a token.
///
/// Returns `None` unless the token has exactly three dot-separated segments
/// and the middle one decodes to a JSON object.
pub fn decode_claims(token: &str) -> Option<Map<String, Value>> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return None;
    };

    let payload: String = payload
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    let bytes = PAYLOAD_ENGINE.decode(payload).ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(claims) => Some(claims),
        _ => None,
    }
}

/// Extract the expiry instant of a token.
///
/// `exp` may be an integer or a float; sub-second precision is kept down to
/// the millisecond.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let exp = decode_claims(token)?.get("exp")?.as_f64()?;
    if !exp.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((exp * 1000.0) as i64)
}

/// Whether the token expires within `horizon` from now.
///
/// A token with no readable expiry is never considered expiring.
pub fn is_expiring_soon(token: &str, horizon: Duration) -> bool {
    is_expiring_soon_at(token, horizon, Utc::now())
}

/// [`is_expiring_soon`] against an explicit clock.
pub fn is_expiring_soon_at(token: &str, horizon: Duration, now: DateTime<Utc>) -> bool {
    decode_expiry(token).is_some_and(|expiry| expiry - now < horizon)
}
