use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::Method;
use serde_json::{Value as JsonValue, json};
use tokio::sync::watch;

use super::api::{ApiCall, ApiOptions, ExecuteOptions};
use super::error::ApiError;
use super::transport::ApiClient;
use crate::types::{LoginPayload, User};
use crate::url::Query;

/// Current user, observable.
///
/// Owned by the application and shared with every [`AuthSession`] that
/// should see the same login state.
#[derive(Debug)]
pub struct AuthStore {
    me: watch::Sender<Option<User>>,
}

impl Default for AuthStore {
    fn default() -> Self {
        let (me, _) = watch::channel(None);
        Self { me }
    }
}

impl AuthStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn me(&self) -> Option<User> {
        self.me.borrow().clone()
    }

    pub fn set_me(&self, user: Option<User>) {
        self.me.send_replace(user);
    }

    pub fn clear(&self) {
        self.set_me(None);
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.me.borrow().is_some()
    }

    /// Receiver notified on every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.me.subscribe()
    }
}

/// Login, logout and profile loading through the SDK routes.
pub struct AuthSession {
    store: Arc<AuthStore>,
    login: ApiCall,
    logout: ApiCall,
    me: ApiCall,
    loading: AtomicUsize,
}

struct Loading<'a>(&'a AtomicUsize);

impl<'a> Loading<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Loading<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AuthSession {
    #[must_use]
    pub fn new(client: ApiClient, store: Arc<AuthStore>) -> Self {
        Self {
            store,
            login: ApiCall::new(client.clone(), "/login", ApiOptions::new(Method::POST).with_error_context("Login")),
            logout: ApiCall::new(client.clone(), "/logout", ApiOptions::new(Method::POST).with_error_context("Logout")),
            me: ApiCall::new(client, "/me", ApiOptions::new(Method::GET).with_error_context("Fetch User Profile")),
            loading: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<AuthStore> {
        &self.store
    }

    #[must_use]
    pub fn me(&self) -> Option<User> {
        self.store.me()
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.store.is_logged_in()
    }

    /// Whether a login, logout or profile load is in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst) > 0
    }

    /// Log in, then load the profile into the store.
    ///
    /// Returns the login reply (`{accessToken}`).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the login is rejected. A failed profile load
    /// only clears the store.
    pub async fn login(&self, payload: &LoginPayload) -> Result<JsonValue, ApiError> {
        let _loading = Loading::start(&self.loading);

        let body = serde_json::to_value(payload).map_err(|e| ApiError::new(e.to_string()))?;
        let reply = self
            .login
            .execute(ExecuteOptions::new().with_body(body))
            .await?
            .into_single()
            .unwrap_or(JsonValue::Null);

        if let Err(e) = self.fetch_user(&[]).await {
            tracing::warn!(error = %e, "Logged in but the profile could not be loaded");
        }
        Ok(reply)
    }

    /// Log out. The store is cleared whether or not the call succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the logout call failed.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let _loading = Loading::start(&self.loading);
        let result = self.logout.execute(ExecuteOptions::new()).await;
        self.store.clear();
        result.map(drop)
    }

    /// Load `/me` into the store, restricted to `fields` unless empty.
    ///
    /// Accepts both `{data: [user, ...]}` and a bare user object.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the call fails or the reply is not a user;
    /// the store is cleared in both cases.
    pub async fn fetch_user(&self, fields: &[&str]) -> Result<Option<User>, ApiError> {
        let _loading = Loading::start(&self.loading);

        let mut query = Query::new();
        if !fields.is_empty() {
            query.insert("fields".into(), json!(fields.join(",")));
        }

        let reply = match self.me.execute(ExecuteOptions::new().with_query(query)).await {
            Ok(data) => data.into_single().unwrap_or(JsonValue::Null),
            Err(e) => {
                self.store.clear();
                return Err(e);
            }
        };

        let user = match user_from_reply(reply) {
            Ok(user) => user,
            Err(e) => {
                self.store.clear();
                return Err(e);
            }
        };
        self.store.set_me(user.clone());
        Ok(user)
    }
}

fn user_from_reply(reply: JsonValue) -> Result<Option<User>, ApiError> {
    let candidate = match reply {
        JsonValue::Object(mut map) if map.contains_key("data") => match map.remove("data") {
            Some(JsonValue::Array(users)) if users.is_empty() => return Ok(None),
            Some(JsonValue::Array(mut users)) => users.swap_remove(0),
            Some(other) => other,
            None => JsonValue::Null,
        },
        JsonValue::Null => return Ok(None),
        other => other,
    };

    serde_json::from_value(candidate.clone())
        .map(Some)
        .map_err(|e| ApiError::new(format!("Invalid user payload: {e}")).with_data(candidate))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use axum::extract::Query as QueryParams;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    use super::*;

    async fn login(Json(body): Json<JsonValue>) -> (StatusCode, Json<JsonValue>) {
        if body["password"] == "secret" {
            (StatusCode::OK, Json(json!({"accessToken": "a"})))
        } else {
            (StatusCode::UNAUTHORIZED, Json(json!({"code": "AUTHENTICATION_ERROR", "message": "Authentication failed"})))
        }
    }

    async fn me(QueryParams(params): QueryParams<HashMap<String, String>>) -> (StatusCode, Json<JsonValue>) {
        match params.get("fields").map(String::as_str) {
            Some("broken") => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"message": "db down"}))),
            Some("bare") => (StatusCode::OK, Json(json!({"id": 1, "email": "bare@x.io"}))),
            Some("empty") => (StatusCode::OK, Json(json!({"data": []}))),
            Some("garbage") => (StatusCode::OK, Json(json!({"data": [{"nope": true}]}))),
            _ => (
                StatusCode::OK,
                Json(json!({"data": [{"id": 1, "email": "a@x.io", "isRootAdmin": true}]})),
            ),
        }
    }

    async fn spawn_server() -> SocketAddr {
        let app = Router::new()
            .route("/enfyra/api/login", post(login))
            .route("/enfyra/api/logout", post(|| async { Json(json!({"success": true})) }))
            .route("/enfyra/api/me", get(me));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    async fn session() -> AuthSession {
        let addr = spawn_server().await;
        AuthSession::new(ApiClient::new(&format!("http://{addr}")).unwrap(), Arc::new(AuthStore::new()))
    }

    #[tokio::test]
    async fn test_store_notifies_subscribers() {
        let store = AuthStore::new();
        let mut rx = store.subscribe();
        assert!(!store.is_logged_in());

        let user: User = serde_json::from_value(json!({"id": 1, "email": "a@x.io"})).unwrap();
        store.set_me(Some(user.clone()));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref(), Some(&user));

        store.clear();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }

    #[tokio::test]
    async fn test_login_loads_profile() {
        let session = session().await;

        let reply = session.login(&LoginPayload::new("a@x.io", "secret")).await.unwrap();

        assert_eq!(reply, json!({"accessToken": "a"}));
        assert!(session.is_logged_in());
        assert!(session.me().unwrap().is_root_admin);
        assert!(!session.is_loading());
    }

    #[tokio::test]
    async fn test_rejected_login_leaves_store_empty() {
        let session = session().await;

        let err = session.login(&LoginPayload::new("a@x.io", "wrong")).await.unwrap_err();

        assert_eq!(err.status, Some(401));
        assert!(!session.is_logged_in());
    }

    #[tokio::test]
    async fn test_fetch_user_reply_shapes() {
        let session = session().await;

        let user = session.fetch_user(&["bare"]).await.unwrap().unwrap();
        assert_eq!(user.email, "bare@x.io");
        assert!(session.is_logged_in());

        assert_eq!(session.fetch_user(&["empty"]).await.unwrap(), None);
        assert!(!session.is_logged_in());

        session.fetch_user(&[]).await.unwrap();
        assert!(session.fetch_user(&["garbage"]).await.is_err());
        assert!(!session.is_logged_in());
    }

    #[tokio::test]
    async fn test_failed_fetch_clears_store() {
        let session = session().await;
        session.fetch_user(&[]).await.unwrap();
        assert!(session.is_logged_in());

        let err = session.fetch_user(&["broken"]).await.unwrap_err();
        assert_eq!(err.message, "db down");
        assert!(!session.is_logged_in());
    }

    #[tokio::test]
    async fn test_logout_always_clears_store() {
        let session = session().await;
        session.fetch_user(&[]).await.unwrap();

        session.logout().await.unwrap();
        assert!(session.me().is_none());
    }
}
