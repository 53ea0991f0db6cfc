//! Client configuration.
//!
//! Every field has a default so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! base_url = "https://exams.example.com/api"
//! refresh_path = "/auth/refresh"
//! request_timeout_secs = 10
//! renewal_horizon_secs = 300
//! default_locale = "en"
//! store = "file"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::session::SessionTtl;
use crate::store::StoreBackend;

/// A configuration value that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix prepended to every relative request path.
    pub base_url: String,

    /// Renewal endpoint, relative to `base_url` unless absolute.
    pub refresh_path: String,

    /// Applies to pipeline requests and to the renewal call.
    pub request_timeout_secs: u64,

    /// How close to expiry an access token may get before it is renewed
    /// proactively.
    pub renewal_horizon_secs: u64,

    /// Sent as `Accept-Language` until a locale is stored.
    pub default_locale: String,

    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,

    /// Where the session is persisted.
    pub store: StoreBackend,

    /// Logging level used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            request_timeout_secs: 10,
            renewal_horizon_secs: 300,
            default_locale: "en".to_string(),
            access_ttl_secs: 86_400,
            refresh_ttl_secs: 2_592_000,
            store: StoreBackend::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Check the values that can be wrong, returning the parsed base URL.
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let base = self.base_url()?;
        resolve_url(&base, &self.refresh_path).map_err(|e| {
            ConfigError::new(format!("refresh_path {:?}: {}", self.refresh_path, e))
        })?;

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::new("request_timeout_secs must be positive"));
        }
        if self.access_ttl_secs == 0 || self.refresh_ttl_secs == 0 {
            return Err(ConfigError::new("session TTLs must be positive"));
        }
        if self.default_locale.trim().is_empty() {
            return Err(ConfigError::new("default_locale must not be empty"));
        }
        Ok(base)
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ConfigError::new(format!("base_url {:?}: {}", self.base_url, e)))?;
        if url.cannot_be_a_base() {
            return Err(ConfigError::new(format!(
                "base_url {:?} cannot be used as a base",
                self.base_url
            )));
        }
        Ok(url)
    }

    pub fn refresh_url(&self) -> Result<Url, ConfigError> {
        resolve_url(&self.base_url()?, &self.refresh_path)
            .map_err(|e| ConfigError::new(format!("refresh_path {:?}: {}", self.refresh_path, e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn renewal_horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.renewal_horizon_secs as i64)
    }

    pub fn session_ttl(&self) -> SessionTtl {
        SessionTtl {
            access: chrono::Duration::seconds(self.access_ttl_secs as i64),
            refresh: chrono::Duration::seconds(self.refresh_ttl_secs as i64),
        }
    }
}

/// Resolve a request path against the base URL.
///
/// Unlike [`Url::join`], a leading slash does not discard the base path:
/// `/auth/refresh` against `https://host/api` gives
/// `https://host/api/auth/refresh`. Absolute URLs are taken as is.
pub fn resolve_url(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return Url::parse(path);
    }
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined)
}
