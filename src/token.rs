use base64::Engine;
use base64::alphabet::URL_SAFE;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use serde_json::Value as JsonValue;

use crate::session::{ACCESS_TOKEN_KEY, CookieSource, CookieStore, REFRESH_TOKEN_KEY};

/// base64url, with or without trailing `=`.
const BASE64_URL_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode a JWT payload without verifying its signature.
///
/// Returns `None` unless the token has exactly three dot-separated segments
/// and the middle one is base64url-encoded UTF-8 JSON. Signature trust is
/// left to the backend.
#[must_use]
pub fn decode_jwt(token: &str) -> Option<JsonValue> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }

    let decoded = BASE64_URL_LENIENT
        .decode(parts[1])
        .inspect_err(|e| tracing::warn!(error = %e, "Failed to decode JWT payload"))
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    serde_json::from_str(&text)
        .inspect_err(|e| tracing::warn!(error = %e, "Failed to parse JWT payload"))
        .ok()
}

/// Whether the token is expired as of now.
///
/// Undecodable tokens and tokens without a numeric `exp` count as expired.
#[must_use]
pub fn is_access_token_expired(token: &str) -> bool {
    is_access_token_expired_at(token, now_ms())
}

/// [`is_access_token_expired`] against an explicit clock (UNIX milliseconds).
#[must_use]
pub fn is_access_token_expired_at(token: &str, now_ms: i64) -> bool {
    let Some(exp) = decode_jwt(token).and_then(|claims| claims.get("exp").and_then(JsonValue::as_f64)) else {
        return true;
    };
    // Truthiness check on `exp`: zero is as good as missing.
    if exp == 0.0 {
        return true;
    }
    now_ms as f64 >= exp * 1000.0
}

fn now_ms() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

/// Outcome of inspecting the session cookies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValidation {
    /// Access token present and unexpired.
    Valid { access_token: String },
    /// Access token missing or expired, refresh token available.
    NeedsRefresh { refresh_token: String },
    /// Nothing usable.
    Anonymous,
}

impl TokenValidation {
    /// The usable access token, if any.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::Valid { access_token } => Some(access_token),
            _ => None,
        }
    }

    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        matches!(self, Self::NeedsRefresh { .. })
    }

    /// Classify raw cookie values against the given clock.
    #[must_use]
    pub fn classify(access_token: Option<String>, refresh_token: Option<String>, now_ms: i64) -> Self {
        let access_token = access_token.filter(|t| !t.is_empty());
        let refresh_token = refresh_token.filter(|t| !t.is_empty());

        match (access_token, refresh_token) {
            (Some(access_token), _) if !is_access_token_expired_at(&access_token, now_ms) => {
                Self::Valid { access_token }
            }
            (_, Some(refresh_token)) => Self::NeedsRefresh { refresh_token },
            _ => Self::Anonymous,
        }
    }
}

/// Validate the session from a request-bound cookie reader.
#[must_use]
pub fn validate_tokens<C: CookieSource + ?Sized>(cookies: &C) -> TokenValidation {
    TokenValidation::classify(
        cookies.cookie(ACCESS_TOKEN_KEY),
        cookies.cookie(REFRESH_TOKEN_KEY),
        now_ms(),
    )
}

/// Validate the session from the ambient cookie store.
pub async fn validate_tokens_from_store<S: CookieStore>(store: &S) -> TokenValidation {
    let access_token = store.get(ACCESS_TOKEN_KEY).await;
    let refresh_token = store.get(REFRESH_TOKEN_KEY).await;
    TokenValidation::classify(access_token, refresh_token, now_ms())
}
