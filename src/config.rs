//! SDK configuration resolution.
//!
//! Layers, highest precedence first: explicit runtime overrides, environment
//! (`ENFYRA_API_URL`, `ENFYRA_API_PREFIX`), the first valid project file,
//! built-in defaults.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Deserialize;

use crate::error::Error;

/// Path namespace reserved for SDK routes.
pub const DEFAULT_API_PREFIX: &str = "/enfyra/api";

/// Project config file looked up in each search directory.
pub const CONFIG_FILE_NAME: &str = "enfyra.config.json";

/// Resolved SDK configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkConfig {
    api_url: String,
    api_prefix: String,
}

impl SdkConfig {
    /// Create config for a backend URL with the default prefix.
    #[must_use]
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: normalize_api_url(&api_url.into()),
            api_prefix: DEFAULT_API_PREFIX.into(),
        }
    }

    #[must_use]
    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    /// Backend URL; empty when nothing configured it.
    #[must_use]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    #[must_use]
    pub fn api_prefix(&self) -> &str {
        &self.api_prefix
    }

    /// Backend URL, or [`Error::Config`] if it was never configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the URL is empty.
    pub fn require_api_url(&self) -> Result<&str, Error> {
        if self.api_url.is_empty() {
            return Err(Error::Config("apiUrl is not configured".into()));
        }
        Ok(&self.api_url)
    }
}

fn normalize_api_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// One partial configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverrides {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_prefix: Option<String>,
}

impl ConfigOverrides {
    /// Read the environment layer. Empty variables count as unset.
    #[must_use]
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_url: var("ENFYRA_API_URL"),
            api_prefix: var("ENFYRA_API_PREFIX"),
        }
    }

    fn has_api_url(&self) -> bool {
        self.api_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Loads one project config file.
pub trait ConfigLoader: Send + Sync {
    /// `Ok(None)` when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file exists but cannot be read or parsed.
    fn load(&self, path: &Path) -> Result<Option<ConfigOverrides>, Error>;
}

/// Reads `enfyra.config.json` files from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFileLoader;

impl ConfigLoader for JsonFileLoader {
    fn load(&self, path: &Path) -> Result<Option<ConfigOverrides>, Error> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Config(format!("{}: {e}", path.display()))),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

/// Resolves [`SdkConfig`] from the configuration layers.
///
/// The file layer is read once and cached until [`invalidate`](Self::invalidate).
pub struct ConfigResolver<L = JsonFileLoader> {
    search_dirs: Vec<PathBuf>,
    loader: L,
    cached: RwLock<Option<Option<Arc<ConfigOverrides>>>>,
}

impl ConfigResolver<JsonFileLoader> {
    /// Resolver that looks for the project file in the current directory.
    #[must_use]
    pub fn from_current_dir() -> Self {
        let dirs = std::env::current_dir().map(|d| vec![d]).unwrap_or_default();
        Self::new(dirs, JsonFileLoader)
    }
}

impl<L: ConfigLoader> ConfigResolver<L> {
    #[must_use]
    pub fn new(search_dirs: Vec<PathBuf>, loader: L) -> Self {
        Self {
            search_dirs,
            loader,
            cached: RwLock::new(None),
        }
    }

    /// First valid project file layer, cached.
    pub fn file_config(&self) -> Option<Arc<ConfigOverrides>> {
        if let Some(cached) = self.cached.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return cached.clone();
        }

        let found = self.search_dirs.iter().find_map(|dir| {
            let path = dir.join(CONFIG_FILE_NAME);
            match self.loader.load(&path) {
                Ok(Some(layer)) if layer.has_api_url() => Some(Arc::new(layer)),
                Ok(Some(_)) => {
                    tracing::warn!(path = %path.display(), "Config file has no apiUrl, skipping");
                    None
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load config file");
                    None
                }
            }
        });

        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(found.clone());
        found
    }

    /// Drop the cached file layer.
    pub fn invalidate(&self) {
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Resolve with the process environment as the environment layer.
    pub fn resolve(&self, runtime: &ConfigOverrides) -> SdkConfig {
        self.resolve_with_env(runtime, &ConfigOverrides::from_env())
    }

    /// Resolve with an explicit environment layer.
    pub fn resolve_with_env(&self, runtime: &ConfigOverrides, env: &ConfigOverrides) -> SdkConfig {
        let file = self.file_config();
        let layers = [Some(runtime), Some(env), file.as_deref()];

        let pick = |field: fn(&ConfigOverrides) -> Option<&String>| {
            layers
                .iter()
                .flatten()
                .find_map(|layer| field(layer).filter(|v| !v.trim().is_empty()).cloned())
        };

        let api_url = pick(|l| l.api_url.as_ref()).unwrap_or_default();
        let api_prefix = pick(|l| l.api_prefix.as_ref()).unwrap_or_else(|| DEFAULT_API_PREFIX.into());

        if api_url.is_empty() {
            tracing::warn!("Enfyra apiUrl is not configured; proxied and login requests will fail");
        }

        SdkConfig::new(api_url).with_api_prefix(api_prefix)
    }
}
