use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::session::{CookieStore, SessionCookieOptions, write_session_cookies};
use crate::url::join_url;

const LOGIN_PATH: &str = "/auth/login";
const REFRESH_PATH: &str = "/auth/refresh-token";

/// Token triple issued by the backend on login and refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry timestamp exactly as the backend reports it.
    pub exp_time: i64,
}

impl TokenPair {
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>, exp_time: i64) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            exp_time,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Client for the backend's `/auth/*` endpoints.
#[derive(Debug, Clone)]
pub struct BackendClient {
    api_url: String,
    http: reqwest::Client,
}

impl BackendClient {
    /// Create a client for the backend rooted at `api_url`.
    #[must_use]
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Backend base URL.
    #[must_use]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Exchange login credentials for a token pair.
    ///
    /// `cookie_header` is the inbound request's `Cookie` header, forwarded as-is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, [`Error::Backend`] with the
    /// raw body if the backend rejects the login, or [`Error::InvalidResponse`]
    /// if the reply is not a token pair.
    pub async fn login(&self, credentials: &JsonValue, cookie_header: Option<&str>) -> Result<TokenPair, Error> {
        let response = self
            .http
            .post(join_url([self.api_url.as_str(), LOGIN_PATH]))
            .header(reqwest::header::COOKIE, cookie_header.unwrap_or_default())
            .json(credentials)
            .send()
            .await?;

        let response = Self::ensure_success(response, "login").await?;
        Self::token_pair(response, "login").await
    }

    /// Exchange a refresh token for a new token pair without persisting it.
    ///
    /// Used where the caller attaches cookies itself (the proxy response).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, [`Error::Backend`] on a
    /// non-2xx reply, or [`Error::InvalidResponse`] on a malformed body.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenPair, Error> {
        let response = self
            .http
            .post(join_url([self.api_url.as_str(), REFRESH_PATH]))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let response = Self::ensure_success(response, "token refresh").await?;
        Self::token_pair(response, "token refresh").await
    }

    /// Refresh and write the new session triplet into an ambient store.
    ///
    /// Returns the new access token.
    ///
    /// # Errors
    ///
    /// Everything [`refresh_token`](Self::refresh_token) returns, plus
    /// [`Error::CookieWrite`] if the store could not take all three cookies.
    pub async fn refresh_and_persist<S: CookieStore>(
        &self,
        store: &S,
        refresh_token: &str,
        options: SessionCookieOptions,
    ) -> Result<String, Error> {
        let pair = self.refresh_token(refresh_token).await?;
        write_session_cookies(store, &pair, options).await?;
        Ok(pair.access_token)
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let detail = response.text().await.unwrap_or_default();
        Err(Error::Backend {
            operation,
            status: Some(status),
            detail,
        })
    }

    async fn token_pair(response: reqwest::Response, operation: &'static str) -> Result<TokenPair, Error> {
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| Error::InvalidResponse {
            operation,
            detail: e.to_string(),
        })
    }
}
