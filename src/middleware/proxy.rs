use axum::Json;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use serde_json::{Value as JsonValue, json};

use super::cookies::merge_session_cookies;
use super::error::{LoginFailure, ProxyError};
use super::forward::{build_upstream_url, forward, read_body};
use super::state::ProxyState;
use crate::session::{removal_cookies, session_cookies};
use crate::token::{TokenValidation, validate_tokens};

const ASSETS_PREFIX: &str = "/assets/";

/// What the proxy does with an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyRoute {
    /// `POST {prefix}/login`.
    Login,
    /// `POST {prefix}/logout`.
    Logout,
    /// `{prefix}`, `{prefix}/*` or `/assets/*`: forwarded to the backend.
    Forward,
    /// Anything else: handed to the application.
    PassThrough,
}

impl ProxyRoute {
    #[must_use]
    pub fn classify(method: &Method, path: &str, api_prefix: &str) -> Self {
        let sub_path = path
            .strip_prefix(api_prefix)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'));

        match sub_path {
            Some("/login") if *method == Method::POST => Self::Login,
            Some("/logout") if *method == Method::POST => Self::Logout,
            Some(_) => Self::Forward,
            None if path.starts_with(ASSETS_PREFIX) => Self::Forward,
            None => Self::PassThrough,
        }
    }
}

/// Middleware entry point installed by [`apply_proxy`](super::apply_proxy).
pub(super) async fn enfyra_proxy(
    State(state): State<ProxyState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    match ProxyRoute::classify(request.method(), request.uri().path(), state.sdk.api_prefix()) {
        ProxyRoute::Login => login(&state, jar, request).await.into_response(),
        ProxyRoute::Logout => logout(jar).into_response(),
        ProxyRoute::Forward => forward_with_session(&state, &jar, request).await.into_response(),
        ProxyRoute::PassThrough => next.run(request).await,
    }
}

// ── Login ──────────────────────────────────────────────────────────

async fn login(
    state: &ProxyState,
    jar: CookieJar,
    request: Request,
) -> Result<(CookieJar, Json<JsonValue>), ProxyError> {
    state.sdk.require_api_url()?;

    let cookie_header = request
        .headers()
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let body = read_body(request.into_body(), state.settings.body_limit)
        .await?
        .ok_or_else(|| {
            tracing::warn!("Login body is empty or unreadable");
            ProxyError::Authentication(LoginFailure::default())
        })?;
    let credentials: JsonValue = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(error = %e, "Login body is not JSON");
        ProxyError::Authentication(LoginFailure::default())
    })?;

    let pair = state
        .backend
        .login(&credentials, cookie_header.as_deref())
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "Backend login failed");
            ProxyError::Authentication(LoginFailure::from_error(&e))
        })?;

    let jar = session_cookies(&pair, state.settings.cookie_options())
        .into_iter()
        .fold(jar, CookieJar::add);

    tracing::info!("Enfyra login successful");

    Ok((jar, Json(json!({ "accessToken": pair.access_token }))))
}

// ── Logout ─────────────────────────────────────────────────────────

fn logout(jar: CookieJar) -> (CookieJar, Json<JsonValue>) {
    // `add` rather than `remove`: the removal must be sent even when the
    // request carried no session cookies.
    let jar = removal_cookies().into_iter().fold(jar, CookieJar::add);
    (jar, Json(json!({ "success": true })))
}

// ── Forward ────────────────────────────────────────────────────────

async fn forward_with_session(
    state: &ProxyState,
    jar: &CookieJar,
    request: Request,
) -> Result<Response, ProxyError> {
    let api_url = state.sdk.require_api_url()?;

    // Read the body before any refresh: a rejected request must not rotate the session.
    let (parts, body) = request.into_parts();
    let body = if parts.method == Method::GET || parts.method == Method::HEAD {
        None
    } else {
        read_body(body, state.settings.body_limit).await?
    };

    let (access_token, staged) = match validate_tokens(jar) {
        TokenValidation::Valid { access_token } => (Some(access_token), None),
        TokenValidation::NeedsRefresh { refresh_token } => {
            match state.backend.refresh_token(&refresh_token).await {
                Ok(pair) => {
                    let cookies = session_cookies(&pair, state.settings.cookie_options());
                    (Some(pair.access_token), Some(cookies))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Token refresh failed, forwarding without credentials");
                    (None, None)
                }
            }
        }
        TokenValidation::Anonymous => (None, None),
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path(), |pq| pq.as_str());
    let url = build_upstream_url(path_and_query, api_url, state.sdk.api_prefix());

    let mut extra_headers = HeaderMap::new();
    if let Some(token) = access_token {
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(value) => {
                extra_headers.insert(AUTHORIZATION, value);
            }
            Err(e) => tracing::warn!(error = %e, "Access token is not a valid header value"),
        }
    }

    tracing::debug!(method = %parts.method, url = %url, "Forwarding to backend");

    let mut response = forward(&state.http, &url, parts, body, extra_headers)
        .await
        .map_err(|e| ProxyError::Transport(e.to_string()))?;

    if let Some(cookies) = staged {
        merge_session_cookies(response.headers_mut(), &cookies);
    }

    Ok(response)
}
