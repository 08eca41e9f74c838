//! Enfyra proxy middleware for Axum.
//!
//! Serves the SDK's login/logout routes, forwards everything under the API
//! prefix (and `/assets/*`) to the Enfyra backend with the session's bearer
//! token, and refreshes expired sessions on the way through.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use enfyra_sdk::middleware::{ProxyConfig, apply_proxy};
//!
//! let app = axum::Router::new().route("/", axum::routing::get(|| async { "home" }));
//!
//! // ENFYRA_API_URL / enfyra.config.json supply the backend URL.
//! let app = apply_proxy(app, ProxyConfig::from_env());
//! # let _: axum::Router = app;
//! ```
//!
//! | Path | Method | Behavior |
//! |---|---|---|
//! | `{prefix}/login` | POST | backend login, sets the session cookies, returns `{accessToken}` |
//! | `{prefix}/logout` | POST | clears the session cookies, returns `{success: true}` |
//! | `{prefix}`, `{prefix}/*`, `/assets/*` | any | forwarded to the backend |
//! | anything else | any | handed to the application |

mod config;
mod cookies;
mod error;
mod forward;
mod proxy;
mod state;

use axum::Router;

pub use config::{DEFAULT_BODY_LIMIT, ProxyConfig};
pub use error::{LoginFailure, ProxyError};
pub use forward::build_upstream_url;
pub use proxy::ProxyRoute;

/// Install the proxy in front of every route of `router`, its fallback included.
///
/// Call this after all routes are added.
pub fn apply_proxy<S>(router: Router<S>, config: ProxyConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let state = state::ProxyState::new(config);
    router.layer(axum::middleware::from_fn_with_state(state, proxy::enfyra_proxy))
}
