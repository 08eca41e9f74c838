use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use axum_extra::extract::cookie::Cookie;

/// Superimpose staged session cookies onto a forwarded response.
///
/// Upstream `Set-Cookie` headers for the same names are dropped; every other
/// upstream cookie is kept. Staged cookies keep all of their attributes.
pub(super) fn merge_session_cookies(headers: &mut HeaderMap, staged: &[Cookie<'static>]) {
    let kept: Vec<HeaderValue> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter(|value| {
            value
                .to_str()
                .ok()
                .and_then(|raw| Cookie::parse(raw).ok())
                .is_none_or(|upstream| staged.iter().all(|c| c.name() != upstream.name()))
        })
        .cloned()
        .collect();

    headers.remove(SET_COOKIE);
    for value in kept {
        headers.append(SET_COOKIE, value);
    }

    for cookie in staged {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                headers.append(SET_COOKIE, value);
            }
            Err(e) => tracing::warn!(cookie = %cookie.name(), error = %e, "Cookie is not a valid header value"),
        }
    }
}
