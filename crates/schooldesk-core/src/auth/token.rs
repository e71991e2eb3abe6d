//! Access-token inspection and proactive refresh planning.
//!
//! Tokens are treated as opaque except for one thing: if an access token is
//! a JWT whose payload carries an `exp` claim, it is used to plan a refresh
//! before the backend starts rejecting it. Signatures are never checked here.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;

/// Refresh this long before the token expires.
pub const REFRESH_THRESHOLD_MINUTES: i64 = 5;

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Decode the `exp` claim of a JWT, if there is one.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    // Some issuers pad the payload even though the JWT format says not to
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.exp?;
    if !exp.is_finite() {
        return None;
    }
    Utc.timestamp_opt(exp as i64, 0).single()
}

/// What to do about an access token that was just installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Less than the threshold remains; refresh right away.
    Immediate,
    /// Refresh after this delay.
    After(std::time::Duration),
    /// The token carries no usable expiry; rely on 401 handling.
    Unscheduled,
}

impl RefreshPlan {
    pub fn for_token(token: &str, now: DateTime<Utc>) -> Self {
        match decode_expiry(token) {
            Some(expiry) => Self::for_expiry(expiry, now),
            None => RefreshPlan::Unscheduled,
        }
    }

    pub fn for_expiry(expiry: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let threshold = Duration::minutes(REFRESH_THRESHOLD_MINUTES);
        let remaining = expiry - now;
        if remaining < threshold {
            return RefreshPlan::Immediate;
        }
        match (remaining - threshold).to_std() {
            Ok(delay) => RefreshPlan::After(delay),
            Err(_) => RefreshPlan::Immediate,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"7","exp":{}}}"#, exp));
    format!("{}.{}.signature", header, payload)
}
