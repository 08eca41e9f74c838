//! Session cookie triplet: names, attributes and the cookie seams.
//!
//! The access token, refresh token and expiry cookies are always written and
//! removed as one unit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

use crate::auth::TokenPair;
use crate::error::Error;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const EXP_TIME_KEY: &str = "expTime";

/// The three session cookie names, in write order.
pub const SESSION_COOKIE_NAMES: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, EXP_TIME_KEY];

/// Attributes shared by the three session cookies.
///
/// `HttpOnly`, `SameSite=Lax` and `Path=/` are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCookieOptions {
    pub secure: bool,
    pub max_age: Option<Duration>,
}

impl Default for SessionCookieOptions {
    fn default() -> Self {
        Self {
            secure: true,
            max_age: None,
        }
    }
}

/// Build the three session cookies for a token pair.
#[must_use]
pub fn session_cookies(pair: &TokenPair, options: SessionCookieOptions) -> [Cookie<'static>; 3] {
    [
        session_cookie(ACCESS_TOKEN_KEY, pair.access_token.clone(), options),
        session_cookie(REFRESH_TOKEN_KEY, pair.refresh_token.clone(), options),
        session_cookie(EXP_TIME_KEY, pair.exp_time.to_string(), options),
    ]
}

fn session_cookie(name: &'static str, value: String, options: SessionCookieOptions) -> Cookie<'static> {
    let mut cookie = Cookie::build((name, value))
        .http_only(true)
        .secure(options.secure)
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    if let Some(max_age) = options.max_age {
        cookie.set_max_age(max_age);
    }
    cookie
}

/// Build removal cookies for the session triplet.
#[must_use]
pub fn removal_cookies() -> [Cookie<'static>; 3] {
    SESSION_COOKIE_NAMES.map(|name| {
        let mut cookie = Cookie::build((name, "")).path("/").build();
        cookie.make_removal();
        cookie
    })
}

/// Synchronous, request-bound cookie reader.
pub trait CookieSource {
    fn cookie(&self, name: &str) -> Option<String>;
}

impl CookieSource for CookieJar {
    fn cookie(&self, name: &str) -> Option<String> {
        self.get(name).map(|c| c.value().to_string())
    }
}

impl CookieSource for HashMap<String, String> {
    fn cookie(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Ambient, asynchronous cookie store (server-rendering context).
///
/// # Example
///
/// ```rust,ignore
/// impl CookieStore for RequestCookies {
///     async fn get(&self, name: &str) -> Option<String> {
///         self.inner.read().await.get(name).map(|c| c.value().to_string())
///     }
///
///     async fn set(&self, cookie: Cookie<'static>) -> Result<(), ...> {
///         self.inner.write().await.add(cookie);
///         Ok(())
///     }
///
///     async fn delete(&self, name: &str) -> Result<(), ...> {
///         self.inner.write().await.remove(Cookie::from(name.to_string()));
///         Ok(())
///     }
/// }
/// ```
pub trait CookieStore: Send + Sync {
    /// Read a cookie value by name.
    fn get(&self, name: &str) -> impl Future<Output = Option<String>> + Send;

    /// Write a cookie with all of its attributes.
    fn set(
        &self,
        cookie: Cookie<'static>,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;

    /// Remove a cookie by name. Removing a missing cookie is not an error.
    fn delete(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;
}

/// Write the session triplet to an ambient store.
///
/// If any write fails the triplet is removed again and
/// [`Error::CookieWrite`] is returned; a half-written session is never left
/// behind.
///
/// # Errors
///
/// Returns [`Error::CookieWrite`] when the store rejects a write.
pub async fn write_session_cookies<S: CookieStore>(
    store: &S,
    pair: &TokenPair,
    options: SessionCookieOptions,
) -> Result<(), Error> {
    for cookie in session_cookies(pair, options) {
        let name = cookie.name().to_string();
        if let Err(e) = store.set(cookie).await {
            tracing::error!(cookie = %name, error = %e, "Session cookie write failed, rolling back");
            if let Err(rollback) = clear_session_cookies(store).await {
                tracing::error!(error = %rollback, "Session cookie rollback failed");
            }
            return Err(Error::CookieWrite(format!("{name}: {e}")));
        }
    }
    Ok(())
}

/// Remove the session triplet from an ambient store.
///
/// Every delete is attempted even if an earlier one fails.
///
/// # Errors
///
/// Returns [`Error::CookieWrite`] naming the first cookie that could not be removed.
pub async fn clear_session_cookies<S: CookieStore>(store: &S) -> Result<(), Error> {
    let mut first_error = None;
    for name in SESSION_COOKIE_NAMES {
        if let Err(e) = store.delete(name).await {
            first_error.get_or_insert_with(|| format!("{name}: {e}"));
        }
    }
    match first_error {
        Some(detail) => Err(Error::CookieWrite(detail)),
        None => Ok(()),
    }
}

/// In-process [`CookieStore`].
#[derive(Debug, Default)]
pub struct MemoryCookieStore {
    cookies: Mutex<HashMap<String, Cookie<'static>>>,
}

impl MemoryCookieStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Full cookie (with attributes) by name.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<Cookie<'static>> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Cookie<'static>>> {
        self.cookies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CookieStore for MemoryCookieStore {
    async fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).map(|c| c.value().to_string())
    }

    async fn set(
        &self,
        cookie: Cookie<'static>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.lock().insert(cookie.name().to_string(), cookie);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.lock().remove(name);
        Ok(())
    }
}
