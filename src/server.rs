//! Authenticated calls from server-side code (rendering, background jobs).
//!
//! Unlike [`crate::client`], there is no browser cookie jar here: the session
//! lives in an ambient [`CookieStore`], and a refreshed session is written
//! straight back into it.

use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value as JsonValue;
use url::Url;

use crate::auth::BackendClient;
use crate::client::{ApiError, append_query, read_api_response};
use crate::config::{ConfigOverrides, ConfigResolver, SdkConfig};
use crate::error::Error;
use crate::session::{CookieStore, SessionCookieOptions};
use crate::token::{TokenValidation, validate_tokens_from_store};
use crate::url::{Query, join_url, merge_query, split_path_query};

/// Origin used when `ENFYRA_APP_URL` is not set.
pub const DEFAULT_APP_URL: &str = "http://localhost:3000";

/// One server-side call.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub body: Option<JsonValue>,
    pub headers: HeaderMap,
    /// Layered over any query already in the path.
    pub query: Query,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: HeaderMap::new(),
            query: Query::new(),
        }
    }
}

impl FetchOptions {
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }
}

/// Server-side entry point to the SDK routes of the application at `app_url`.
#[derive(Debug, Clone)]
pub struct ServerApi {
    app_url: Url,
    sdk: SdkConfig,
    backend: BackendClient,
    http: reqwest::Client,
    cookie_options: SessionCookieOptions,
}

impl ServerApi {
    /// # Errors
    ///
    /// Returns [`ApiError`] if `app_url` is not an absolute URL.
    pub fn new(app_url: &str, sdk: SdkConfig) -> Result<Self, ApiError> {
        let app_url = Url::parse(app_url).map_err(|e| ApiError::new(format!("Invalid app URL {app_url}: {e}")))?;
        Ok(Self {
            app_url,
            backend: BackendClient::new(sdk.api_url()),
            sdk,
            http: reqwest::Client::new(),
            cookie_options: SessionCookieOptions::default(),
        })
    }

    /// Build from `ENFYRA_APP_URL` and the resolved SDK configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if `ENFYRA_APP_URL` is not an absolute URL.
    pub fn from_env() -> Result<Self, ApiError> {
        let app_url = std::env::var("ENFYRA_APP_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_APP_URL.to_string());
        let sdk = ConfigResolver::from_current_dir().resolve(&ConfigOverrides::default());
        Self::new(&app_url, sdk)
    }

    /// Attributes for cookies written after a refresh.
    #[must_use]
    pub fn with_cookie_options(mut self, options: SessionCookieOptions) -> Self {
        self.cookie_options = options;
        self
    }

    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.backend = self.backend.with_http_client(client.clone());
        self.http = client;
        self
    }

    #[must_use]
    pub fn app_url(&self) -> &Url {
        &self.app_url
    }

    #[must_use]
    pub fn sdk(&self) -> &SdkConfig {
        &self.sdk
    }

    /// Call `{app_url}{prefix}/{path}` with the session from `store`.
    ///
    /// An expired session is refreshed first and the new tokens are written
    /// back to `store`. If the refresh itself fails the call goes out
    /// anonymously.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the backend URL is not configured, the store
    /// rejects the refreshed session, the request fails, or the reply is non-2xx.
    pub async fn fetch<S: CookieStore>(
        &self,
        store: &S,
        path: &str,
        options: FetchOptions,
    ) -> Result<JsonValue, ApiError> {
        self.sdk.require_api_url()?;

        let access_token = match validate_tokens_from_store(store).await {
            TokenValidation::Valid { access_token } => Some(access_token),
            TokenValidation::NeedsRefresh { refresh_token } => self.refresh(store, &refresh_token).await?,
            TokenValidation::Anonymous => None,
        };

        let (path, path_query) = split_path_query(path);
        let query = merge_query([Some(&path_query), Some(&options.query)]);
        let url = self.url_for(&path, &query)?;

        tracing::debug!(method = %options.method, url = %url, "Enfyra server fetch");

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.extend(options.headers);
        if let Some(token) = access_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ApiError::new(format!("Invalid access token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut request = self.http.request(options.method, url).headers(headers);
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        read_api_response(request.send().await?).await
    }

    async fn refresh<S: CookieStore>(&self, store: &S, refresh_token: &str) -> Result<Option<String>, ApiError> {
        match self
            .backend
            .refresh_and_persist(store, refresh_token, self.cookie_options)
            .await
        {
            Ok(token) => Ok(Some(token)),
            Err(e @ Error::CookieWrite(_)) => Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed, continuing without a session");
                Ok(None)
            }
        }
    }

    fn url_for(&self, path: &str, query: &Query) -> Result<Url, ApiError> {
        let relative = join_url([self.sdk.api_prefix(), path]);
        let mut url = self
            .app_url
            .join(&format!("/{relative}"))
            .map_err(|e| ApiError::new(format!("Invalid request path {path}: {e}")))?;
        append_query(&mut url, query);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::{StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use axum_extra::extract::cookie::Cookie;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::session::{ACCESS_TOKEN_KEY, EXP_TIME_KEY, MemoryCookieStore, REFRESH_TOKEN_KEY};
    use crate::token::tests::token_expiring_in;

    #[derive(Clone)]
    struct Backend {
        refreshes: Arc<AtomicUsize>,
        fresh_token: Arc<String>,
    }

    async fn refresh(State(backend): State<Backend>, Json(body): Json<JsonValue>) -> Response {
        backend.refreshes.fetch_add(1, Ordering::SeqCst);
        if body["refreshToken"] == "good" {
            Json(json!({
                "accessToken": backend.fresh_token.as_str(),
                "refreshToken": "rotated",
                "expTime": 999,
            }))
            .into_response()
        } else {
            (StatusCode::UNAUTHORIZED, Json(json!({"message": "expired"}))).into_response()
        }
    }

    async fn app(
        method: axum::http::Method,
        uri: Uri,
        headers: axum::http::HeaderMap,
        body: String,
    ) -> Response {
        match uri.path() {
            "/enfyra/api/text" => "hello".into_response(),
            "/enfyra/api/missing" => {
                (StatusCode::NOT_FOUND, Json(json!({"message": "No route"}))).into_response()
            }
            _ => Json(json!({
                "method": method.as_str(),
                "uri": uri.to_string(),
                "authorization": headers.get("authorization").and_then(|v| v.to_str().ok()),
                "contentType": headers.get("content-type").and_then(|v| v.to_str().ok()),
                "tenant": headers.get("x-tenant").and_then(|v| v.to_str().ok()),
                "body": body,
            }))
            .into_response(),
        }
    }

    async fn spawn_server() -> (SocketAddr, Backend) {
        let backend = Backend {
            refreshes: Arc::new(AtomicUsize::new(0)),
            fresh_token: Arc::new(token_expiring_in(3600)),
        };
        let router = Router::new()
            .route("/auth/refresh-token", post(refresh))
            .fallback(app)
            .with_state(backend.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        (addr, backend)
    }

    fn api(addr: SocketAddr) -> ServerApi {
        ServerApi::new(&format!("http://{addr}"), SdkConfig::new(format!("http://{addr}"))).unwrap()
    }

    async fn store_with(pairs: &[(&'static str, String)]) -> MemoryCookieStore {
        let store = MemoryCookieStore::new();
        for (name, value) in pairs {
            store.set(Cookie::new(*name, value.clone())).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_anonymous_fetch_merges_query() {
        let (addr, backend) = spawn_server().await;
        let store = MemoryCookieStore::new();
        let query: Query = [("limit".into(), json!(10)), ("sort".into(), json!("-id"))].into();

        let echo = api(addr)
            .fetch(&store, "/posts?sort=id&page=2", FetchOptions::default().with_query(query))
            .await
            .unwrap();

        assert_eq!(echo["uri"], "/enfyra/api/posts?limit=10&page=2&sort=-id");
        assert_eq!(echo["authorization"], JsonValue::Null);
        assert_eq!(echo["contentType"], "application/json");
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_valid_session_sends_bearer_and_body() {
        let (addr, backend) = spawn_server().await;
        let token = token_expiring_in(600);
        let store = store_with(&[(ACCESS_TOKEN_KEY, token.clone())]).await;

        let echo = api(addr)
            .fetch(
                &store,
                "users",
                FetchOptions::new(Method::PATCH)
                    .with_body(json!({"name": "x"}))
                    .with_header(
                        reqwest::header::HeaderName::from_static("x-tenant"),
                        HeaderValue::from_static("t1"),
                    ),
            )
            .await
            .unwrap();

        assert_eq!(echo["method"], "PATCH");
        assert_eq!(echo["authorization"], format!("Bearer {token}"));
        assert_eq!(echo["tenant"], "t1");
        assert_eq!(echo["body"], r#"{"name":"x"}"#);
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_session_refreshes_into_store() {
        let (addr, backend) = spawn_server().await;
        let store = store_with(&[
            (ACCESS_TOKEN_KEY, token_expiring_in(-60)),
            (REFRESH_TOKEN_KEY, "good".to_string()),
        ])
        .await;

        let echo = api(addr).fetch(&store, "me", FetchOptions::default()).await.unwrap();

        assert_eq!(echo["authorization"], format!("Bearer {}", backend.fresh_token));
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(ACCESS_TOKEN_KEY).await.as_deref(), Some(backend.fresh_token.as_str()));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).await.as_deref(), Some("rotated"));
        assert_eq!(store.get(EXP_TIME_KEY).await.as_deref(), Some("999"));
    }

    #[tokio::test]
    async fn test_failed_refresh_goes_out_anonymous() {
        let (addr, backend) = spawn_server().await;
        let store = store_with(&[(REFRESH_TOKEN_KEY, "stale".to_string())]).await;

        let echo = api(addr).fetch(&store, "me", FetchOptions::default()).await.unwrap();

        assert_eq!(echo["authorization"], JsonValue::Null);
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(REFRESH_TOKEN_KEY).await.as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn test_text_and_error_replies() {
        let (addr, _) = spawn_server().await;
        let store = MemoryCookieStore::new();
        let api = api(addr);

        let text = api.fetch(&store, "text", FetchOptions::default()).await.unwrap();
        assert_eq!(text, json!("hello"));

        let err = api.fetch(&store, "missing", FetchOptions::default()).await.unwrap_err();
        assert_eq!(err.status, Some(404));
        assert_eq!(err.message, "No route");
    }

    #[tokio::test]
    async fn test_missing_api_url_is_config_error() {
        let api = ServerApi::new("http://127.0.0.1:9", SdkConfig::new("")).unwrap();

        let err = api
            .fetch(&MemoryCookieStore::new(), "me", FetchOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.message, "Configuration error: apiUrl is not configured");
        assert!(err.status.is_none());
    }

    struct ReadOnlyStore(MemoryCookieStore);

    impl CookieStore for ReadOnlyStore {
        async fn get(&self, name: &str) -> Option<String> {
            self.0.get(name).await
        }

        async fn set(&self, _: Cookie<'static>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("read-only during render".into())
        }

        async fn delete(&self, name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.0.delete(name).await
        }
    }

    #[tokio::test]
    async fn test_rejected_cookie_write_is_fatal() {
        let (addr, _) = spawn_server().await;
        let store = ReadOnlyStore(store_with(&[(REFRESH_TOKEN_KEY, "good".to_string())]).await);

        let err = api(addr).fetch(&store, "me", FetchOptions::default()).await.unwrap_err();

        assert!(err.message.starts_with("Session cookie write failed"));
    }
}
