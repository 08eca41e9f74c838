use time::Duration;

use crate::config::{ConfigOverrides, ConfigResolver, SdkConfig};
use crate::session::SessionCookieOptions;

/// Upper bound on an inbound body read by the proxy (10 MiB).
pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Settings shared by config and runtime state.
#[derive(Debug, Clone)]
pub(crate) struct ProxySettings {
    pub(crate) secure_cookies: bool,
    pub(crate) cookie_max_age: Option<Duration>,
    pub(crate) body_limit: usize,
}

impl ProxySettings {
    fn defaults() -> Self {
        Self {
            secure_cookies: true,
            cookie_max_age: None,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub(crate) fn cookie_options(&self) -> SessionCookieOptions {
        SessionCookieOptions {
            secure: self.secure_cookies,
            max_age: self.cookie_max_age,
        }
    }
}

/// Proxy middleware configuration.
///
/// Use [`from_env()`](ProxyConfig::from_env) for convention-based setup,
/// or [`new()`](ProxyConfig::new) with `with_*` methods for full control.
pub struct ProxyConfig {
    pub(super) sdk: SdkConfig,
    pub(super) settings: ProxySettings,
    pub(super) http: Option<reqwest::Client>,
}

impl ProxyConfig {
    /// Create config for an already resolved [`SdkConfig`].
    #[must_use]
    pub fn new(sdk: SdkConfig) -> Self {
        Self {
            sdk,
            settings: ProxySettings::defaults(),
            http: None,
        }
    }

    /// Resolve the SDK config from the environment and `enfyra.config.json`
    /// in the current directory.
    ///
    /// # Optional env vars
    /// - `ENFYRA_API_URL`: backend base URL
    /// - `ENFYRA_API_PREFIX`: SDK route namespace (default `/enfyra/api`)
    /// - `ENFYRA_INSECURE_COOKIES`: `"1"` or `"true"` drops the `Secure` cookie flag
    ///
    /// A missing backend URL is not an error here; affected requests answer 500.
    #[must_use]
    pub fn from_env() -> Self {
        let sdk = ConfigResolver::from_current_dir().resolve(&ConfigOverrides::default());
        let insecure = matches!(
            std::env::var("ENFYRA_INSECURE_COOKIES").as_deref(),
            Ok("1") | Ok("true"),
        );
        Self::new(sdk).with_secure_cookies(!insecure)
    }

    #[must_use]
    pub fn sdk(&self) -> &SdkConfig {
        &self.sdk
    }

    /// Set the `Secure` flag on session cookies (default `true`).
    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.settings.secure_cookies = secure;
        self
    }

    /// Give session cookies a `Max-Age`. Without it they are browser-session cookies.
    #[must_use]
    pub fn with_cookie_max_age(mut self, max_age: Duration) -> Self {
        self.settings.cookie_max_age = Some(max_age);
        self
    }

    /// Largest inbound body the proxy reads; larger requests get a 413.
    #[must_use]
    pub fn with_body_limit(mut self, bytes: usize) -> Self {
        self.settings.body_limit = bytes;
        self
    }

    /// Use a custom HTTP client for backend calls.
    ///
    /// The default client does not follow redirects so 3xx replies reach the caller.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }
}
