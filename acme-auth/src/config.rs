//! Configuration for the auth core.
//!
//! Values are merged from `config/default.toml`, `config/local.toml` and
//! `ACME_AUTH_*` environment variables (nested keys separated by `__`, e.g.
//! `ACME_AUTH_SESSION__SECRET`).

use crate::seal::MIN_PASSWORD_LEN;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Configuration errors. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No session secret was configured.
    #[error("session secret is not set in configuration")]
    MissingSessionSecret,

    /// The session secret is too short to seal with.
    #[error("session secret must be at least {min} characters")]
    WeakSessionSecret {
        /// Required minimum length.
        min: usize,
    },

    /// The redis backend was selected without a URL.
    #[error("store.redis_url is required when store.backend = \"redis\"")]
    MissingRedisUrl,

    /// The redis backend was requested but the crate was built without it.
    #[error("redis session store requested but the `redis` feature is disabled")]
    RedisUnavailable,

    /// A required OIDC setting is missing.
    #[error("incomplete OIDC configuration: `oidc.{0}` is required")]
    IncompleteOidc(&'static str),

    /// A configured URL could not be parsed.
    #[error("invalid URL for `{field}`: {source}")]
    InvalidUrl {
        /// Configuration key.
        field: &'static str,
        /// Parse failure.
        source: url::ParseError,
    },

    /// The redis connection pool could not be created.
    #[cfg(feature = "redis")]
    #[error("failed to create redis pool: {0}")]
    RedisPool(#[from] deadpool_redis::CreatePoolError),

    /// Configuration sources could not be merged or extracted.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Session cookie and sealing settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Session and flow store backend.
    #[serde(default)]
    pub store: StoreConfig,
    /// OIDC provider settings.
    #[serde(default)]
    pub oidc: OidcConfig,
}

/// Session configuration.
#[derive(Clone, Deserialize)]
pub struct SessionConfig {
    /// Secret used to seal session tokens.
    pub secret: Option<String>,
    /// Default session TTL in seconds.
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,
    /// Cookie domain. Host-only cookies when unset.
    pub cookie_domain: Option<String>,
}

/// Session store backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map. Not shared between instances.
    Memory,
    /// Redis with native key expiry.
    Redis,
}

/// Store configuration.
#[derive(Clone, Deserialize)]
pub struct StoreConfig {
    /// Explicit backend. Inferred from `redis_url` when unset.
    pub backend: Option<StoreBackend>,
    /// Redis connection URL.
    pub redis_url: Option<String>,
    /// Redis password, applied to `redis_url`.
    pub redis_token: Option<String>,
    /// Prefix for every redis key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Purge interval for the memory backend in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

/// OIDC configuration as loaded. Validated into [`OidcSettings`].
#[derive(Clone, Deserialize)]
pub struct OidcConfig {
    /// Issuer URL used for discovery.
    pub issuer: Option<String>,
    /// Client identifier registered with the provider.
    pub client_id: Option<String>,
    /// Client secret registered with the provider.
    pub client_secret: Option<String>,
    /// Public origin of this application, e.g. `https://shop.example.com`.
    pub redirect_origin: Option<String>,
    /// Path of the callback route on `redirect_origin`.
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
    /// Path on `redirect_origin` the provider returns to after logout.
    #[serde(default = "default_post_logout_path")]
    pub post_logout_path: String,
    /// Space separated scopes.
    #[serde(default = "default_scopes")]
    pub scopes: String,
    /// Send a PKCE S256 challenge with every authorization request.
    #[serde(default = "default_enforce_pkce")]
    pub enforce_pkce: bool,
}

/// Validated OIDC settings.
#[derive(Clone)]
pub struct OidcSettings {
    /// Issuer URL.
    pub issuer: Url,
    /// Client identifier.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
    /// Absolute callback URL.
    pub redirect_uri: Url,
    /// Absolute post-logout URL.
    pub post_logout_redirect_uri: Url,
    /// Space separated scopes.
    pub scopes: String,
    /// Whether PKCE is sent.
    pub enforce_pkce: bool,
}

// Default value functions
const fn default_session_ttl() -> u64 {
    3600 // 1 hour
}

fn default_key_prefix() -> String {
    "acme".to_string()
}

const fn default_cleanup_interval() -> u64 {
    60
}

fn default_callback_path() -> String {
    "/api/auth/oidc/callback".to_string()
}

fn default_post_logout_path() -> String {
    "/".to_string()
}

fn default_scopes() -> String {
    "openid email profile".to_string()
}

const fn default_enforce_pkce() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_seconds: default_session_ttl(),
            cookie_domain: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: None,
            redis_url: None,
            redis_token: None,
            key_prefix: default_key_prefix(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            client_id: None,
            client_secret: None,
            redirect_origin: None,
            callback_path: default_callback_path(),
            post_logout_path: default_post_logout_path(),
            scopes: default_scopes(),
            enforce_pkce: default_enforce_pkce(),
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .field("ttl_seconds", &self.ttl_seconds)
            .field("cookie_domain", &self.cookie_domain)
            .finish()
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("backend", &self.backend)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[redacted]"))
            .field("redis_token", &self.redis_token.as_ref().map(|_| "[redacted]"))
            .field("key_prefix", &self.key_prefix)
            .field("cleanup_interval_seconds", &self.cleanup_interval_seconds)
            .finish()
    }
}

impl std::fmt::Debug for OidcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcConfig")
            .field("issuer", &self.issuer)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[redacted]"))
            .field("redirect_origin", &self.redirect_origin)
            .field("callback_path", &self.callback_path)
            .field("post_logout_path", &self.post_logout_path)
            .field("scopes", &self.scopes)
            .field("enforce_pkce", &self.enforce_pkce)
            .finish()
    }
}

impl std::fmt::Debug for OidcSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcSettings")
            .field("issuer", &self.issuer.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("post_logout_redirect_uri", &self.post_logout_redirect_uri.as_str())
            .field("scopes", &self.scopes)
            .field("enforce_pkce", &self.enforce_pkce)
            .finish()
    }
}

impl AuthConfig {
    /// Load configuration from files and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file("config/default.toml"))
                .merge(Toml::file("config/local.toml"))
                .merge(Env::prefixed("ACME_AUTH_").split("__")),
        )
    }

    /// Extract configuration from an arbitrary figment.
    ///
    /// # Errors
    ///
    /// Returns an error if extraction fails.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }
}

impl SessionConfig {
    /// Default session lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Return the configured secret, checking its strength.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is missing or too short.
    pub fn require_secret(&self) -> Result<&str, ConfigError> {
        let secret = self
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSessionSecret)?;
        if secret.len() < MIN_PASSWORD_LEN {
            return Err(ConfigError::WeakSessionSecret {
                min: MIN_PASSWORD_LEN,
            });
        }
        Ok(secret)
    }
}

impl StoreConfig {
    /// Resolve which backend to use.
    ///
    /// An explicit `backend` wins. Otherwise a configured `redis_url`
    /// selects redis, and memory is the fallback.
    #[must_use]
    pub fn resolved_backend(&self) -> StoreBackend {
        match (self.backend, self.redis_url.as_deref()) {
            (Some(backend), _) => backend,
            (None, Some(url)) if !url.is_empty() => StoreBackend::Redis,
            (None, _) => StoreBackend::Memory,
        }
    }

    /// Redis URL with `redis_token` applied as the password.
    ///
    /// # Errors
    ///
    /// Returns an error if no URL is configured or it cannot be parsed.
    pub fn redis_connection_url(&self) -> Result<String, ConfigError> {
        let raw = self
            .redis_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::MissingRedisUrl)?;
        let mut url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
            field: "store.redis_url",
            source,
        })?;
        if let Some(token) = self.redis_token.as_deref().filter(|t| !t.is_empty()) {
            // Only fails for URLs that cannot carry credentials.
            if url.set_password(Some(token)).is_err() {
                return Err(ConfigError::InvalidUrl {
                    field: "store.redis_url",
                    source: url::ParseError::EmptyHost,
                });
            }
        }
        Ok(url.into())
    }

    /// Memory backend purge interval.
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

impl OidcConfig {
    /// Whether any provider setting was supplied.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        [
            &self.issuer,
            &self.client_id,
            &self.client_secret,
            &self.redirect_origin,
        ]
        .into_iter()
        .any(|v| v.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }

    /// Validate into usable settings.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing or malformed setting.
    pub fn settings(&self) -> Result<OidcSettings, ConfigError> {
        let issuer = required(self.issuer.as_deref(), "issuer")?;
        let client_id = required(self.client_id.as_deref(), "client_id")?;
        let client_secret = required(self.client_secret.as_deref(), "client_secret")?;
        let origin = required(self.redirect_origin.as_deref(), "redirect_origin")?;

        let issuer = parse_url(issuer, "oidc.issuer")?;
        let origin = parse_url(origin, "oidc.redirect_origin")?;
        let redirect_uri = origin
            .join(&self.callback_path)
            .map_err(|source| ConfigError::InvalidUrl {
                field: "oidc.callback_path",
                source,
            })?;
        let post_logout_redirect_uri =
            origin
                .join(&self.post_logout_path)
                .map_err(|source| ConfigError::InvalidUrl {
                    field: "oidc.post_logout_path",
                    source,
                })?;

        Ok(OidcSettings {
            issuer,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri,
            post_logout_redirect_uri,
            scopes: self.scopes.clone(),
            enforce_pkce: self.enforce_pkce,
        })
    }
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, ConfigError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::IncompleteOidc(field))
}

fn parse_url(raw: &str, field: &'static str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { field, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "session-secret-32-chars-long-string!";

    fn from_toml(toml: &str) -> AuthConfig {
        AuthConfig::from_figment(Figment::from(Toml::string(toml))).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = AuthConfig::default();
        assert!(config.session.secret.is_none());
        assert_eq!(config.session.ttl_seconds, 3600);
        assert_eq!(config.store.key_prefix, "acme");
        assert_eq!(config.store.resolved_backend(), StoreBackend::Memory);
        assert!(config.oidc.enforce_pkce);
        assert_eq!(config.oidc.scopes, "openid email profile");
    }

    #[test]
    fn test_parses_toml() {
        let config = from_toml(&format!(
            r#"
            [session]
            secret = "{SECRET}"
            ttl_seconds = 600
            cookie_domain = "example.com"

            [store]
            backend = "memory"
            "#
        ));
        assert_eq!(config.session.require_secret().unwrap(), SECRET);
        assert_eq!(config.session.ttl(), Duration::from_secs(600));
        assert_eq!(config.session.cookie_domain.as_deref(), Some("example.com"));
        assert_eq!(config.store.resolved_backend(), StoreBackend::Memory);
    }

    #[test]
    fn test_invalid_backend_rejected() {
        let result = AuthConfig::from_figment(Figment::from(Toml::string(
            "[store]\nbackend = \"postgres\"",
        )));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_missing_secret() {
        let config = SessionConfig::default();
        assert!(matches!(
            config.require_secret(),
            Err(ConfigError::MissingSessionSecret)
        ));

        let empty = SessionConfig {
            secret: Some(String::new()),
            ..SessionConfig::default()
        };
        assert!(matches!(
            empty.require_secret(),
            Err(ConfigError::MissingSessionSecret)
        ));
    }

    #[test]
    fn test_weak_secret() {
        let config = SessionConfig {
            secret: Some("short".to_string()),
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.require_secret(),
            Err(ConfigError::WeakSessionSecret { .. })
        ));
    }

    #[test]
    fn test_redis_inferred_from_url() {
        let config = StoreConfig {
            redis_url: Some("redis://cache.internal:6379".to_string()),
            ..StoreConfig::default()
        };
        assert_eq!(config.resolved_backend(), StoreBackend::Redis);

        let forced = StoreConfig {
            backend: Some(StoreBackend::Memory),
            ..config
        };
        assert_eq!(forced.resolved_backend(), StoreBackend::Memory);
    }

    #[test]
    fn test_redis_url_requires_value() {
        let config = StoreConfig {
            backend: Some(StoreBackend::Redis),
            ..StoreConfig::default()
        };
        assert!(matches!(
            config.redis_connection_url(),
            Err(ConfigError::MissingRedisUrl)
        ));
    }

    #[test]
    fn test_redis_token_applied_as_password() {
        let config = StoreConfig {
            redis_url: Some("redis://cache.internal:6379/0".to_string()),
            redis_token: Some("hunter2".to_string()),
            ..StoreConfig::default()
        };
        let url = config.redis_connection_url().unwrap();
        assert_eq!(url, "redis://:hunter2@cache.internal:6379/0");
    }

    #[test]
    fn test_oidc_settings() {
        let config = OidcConfig {
            issuer: Some("https://id.example.com".to_string()),
            client_id: Some("shop".to_string()),
            client_secret: Some("oauth-secret".to_string()),
            redirect_origin: Some("https://shop.example.com".to_string()),
            ..OidcConfig::default()
        };
        let settings = config.settings().unwrap();
        assert_eq!(
            settings.redirect_uri.as_str(),
            "https://shop.example.com/api/auth/oidc/callback"
        );
        assert_eq!(
            settings.post_logout_redirect_uri.as_str(),
            "https://shop.example.com/"
        );
        assert!(settings.enforce_pkce);
    }

    #[test]
    fn test_oidc_is_configured() {
        assert!(!OidcConfig::default().is_configured());
        let partial = OidcConfig {
            client_id: Some("shop".to_string()),
            ..OidcConfig::default()
        };
        assert!(partial.is_configured());
    }

    #[test]
    fn test_incomplete_oidc_settings() {
        let config = OidcConfig {
            issuer: Some("https://id.example.com".to_string()),
            client_id: Some("shop".to_string()),
            ..OidcConfig::default()
        };
        assert!(matches!(
            config.settings(),
            Err(ConfigError::IncompleteOidc("client_secret"))
        ));
    }

    #[test]
    fn test_invalid_oidc_issuer() {
        let config = OidcConfig {
            issuer: Some("not a url".to_string()),
            client_id: Some("shop".to_string()),
            client_secret: Some("oauth-secret".to_string()),
            redirect_origin: Some("https://shop.example.com".to_string()),
            ..OidcConfig::default()
        };
        assert!(matches!(
            config.settings(),
            Err(ConfigError::InvalidUrl { field: "oidc.issuer", .. })
        ));
    }
}
