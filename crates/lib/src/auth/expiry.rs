//! Access token expiry heuristic.
//!
//! The authenticate endpoint does not report when the access token expires. Tokens of the
//! form `t1.v2.<a>.<b>.<c>` carry a truncated base64 JSON object in their fourth segment
//! that usually contains an `"exp":<unix seconds>,` field; failing that, a fixed lifetime
//! is assumed.

use std::sync::LazyLock;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;

/// Lifetime, in hours, assumed when the token carries no readable expiry.
pub const ASSUMED_LIFETIME_HOURS: i64 = 8;

const TOKEN_PREFIX: &str = "t1.v2.";

static EXP_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""exp":(\d+),"#).unwrap());

/// Where an expiry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirySource {
    /// Read from the token itself.
    Embedded,
    /// `now + ASSUMED_LIFETIME_HOURS`.
    Assumed,
}

/// Best guess at when `token` expires.
pub fn guess_expiry(token: &str, now: DateTime<Utc>) -> (DateTime<Utc>, ExpirySource) {
    if let Some(exp) = embedded_expiry(token) {
        log::debug!("auth: using expiry from token: {}", exp);
        return (exp, ExpirySource::Embedded);
    }
    log::warn!(
        "auth: token has no readable expiry, assuming {} hours",
        ASSUMED_LIFETIME_HOURS
    );
    (
        now + Duration::hours(ASSUMED_LIFETIME_HOURS),
        ExpirySource::Assumed,
    )
}

fn embedded_expiry(token: &str) -> Option<DateTime<Utc>> {
    if !token.starts_with(TOKEN_PREFIX) {
        return None;
    }
    let parts: Vec<&str> = token.splitn(5, '.').collect();
    if parts.len() != 5 {
        return None;
    }
    // The segment is cut off mid-stream; decode only whole 4-character groups.
    let fragment = parts[3].as_bytes();
    let whole = &fragment[..fragment.len() - fragment.len() % 4];
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(whole)
        .ok()?;
    let text = String::from_utf8_lossy(&decoded);
    find_exp(&text).and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// First `"exp":<digits>,` in `text`.
fn find_exp(text: &str) -> Option<i64> {
    EXP_PATTERN.captures(text)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_claims(claims: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(claims);
        // Cut mid-group like the real tokens.
        let cut = &encoded[..encoded.len() - 3];
        format!("t1.v2.abc.{}.sig", cut)
    }

    #[test]
    fn reads_embedded_exp() {
        let now = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        let tok = token_with_claims(r#"{"iss":"sense","exp":1685570726,"sub":"12345","more":"xxxxxxxx"}"#);
        let (exp, src) = guess_expiry(&tok, now);
        assert_eq!(src, ExpirySource::Embedded);
        assert_eq!(exp.timestamp(), 1685570726);
    }

    #[test]
    fn falls_back_without_prefix() {
        let now = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        let (exp, src) = guess_expiry("opaque-token", now);
        assert_eq!(src, ExpirySource::Assumed);
        assert_eq!(exp, now + Duration::hours(8));
    }

    #[test]
    fn falls_back_without_exp_field() {
        let now = Utc::now();
        let tok = token_with_claims(r#"{"iss":"sense","sub":"12345","padding":"yyyyyyyy"}"#);
        assert_eq!(guess_expiry(&tok, now).1, ExpirySource::Assumed);
        assert_eq!(guess_expiry("t1.v2.too.short", now).1, ExpirySource::Assumed);
        assert_eq!(guess_expiry("t1.v2.a.!!!!.b", now).1, ExpirySource::Assumed);
    }

    #[test]
    fn exp_must_be_followed_by_comma() {
        assert_eq!(find_exp(r#"{"exp":123}"#), None);
        assert_eq!(find_exp(r#"{"exp":"x","exp":42,"a":1}"#), Some(42));
        assert_eq!(find_exp(r#"{"exp":99999999999999999999,"a":1}"#), None);
    }
}
